use crate::table::ResourceTable;

/// A trait which provides access to the [`ResourceTable`] inside the
/// embedder's state.
///
/// Every host surface in these crates reaches its resources through this
/// trait, so one table can be shared by the io, cli, sockets and http
/// interfaces of a single instantiation.
pub trait IoView: Send {
    /// Yields mutable access to the internal resource management that this
    /// host state has.
    fn table(&mut self) -> &mut ResourceTable;
}

impl<T: ?Sized + IoView> IoView for &mut T {
    fn table(&mut self) -> &mut ResourceTable {
        T::table(self)
    }
}

impl<T: ?Sized + IoView> IoView for Box<T> {
    fn table(&mut self) -> &mut ResourceTable {
        T::table(self)
    }
}

impl IoView for ResourceTable {
    fn table(&mut self) -> &mut ResourceTable {
        self
    }
}

/// A small newtype wrapper which serves as the basis for implementations of
/// the `Host` io traits in this crate.
///
/// This type is used to implement the host traits of `wasi:io` for any
/// state that provides an [`IoView`].
#[repr(transparent)]
pub struct IoImpl<T>(pub T);

impl<T: IoView> IoView for IoImpl<T> {
    fn table(&mut self) -> &mut ResourceTable {
        T::table(&mut self.0)
    }
}

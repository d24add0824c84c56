use crate::table::{Resource, ResourceTable, TableError};
use anyhow::Result;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

pub type PollableFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
pub type MakeFuture = for<'a> fn(&'a mut dyn Any) -> Result<PollableFuture<'a>, TableError>;

/// A host representation of the `wasi:io/poll.pollable` resource.
///
/// A pollable watches one readiness condition of its parent resource. Once
/// that condition has been observed the pollable stays ready: `ready` never
/// goes back to `false`, and `block` returns immediately from then on. Guests
/// subscribe again to wait for the next condition.
pub struct Pollable {
    pub(crate) index: u32,
    pub(crate) make_future: MakeFuture,
    pub(crate) remove_index_on_delete: Option<fn(&mut ResourceTable, u32) -> Result<()>>,
    pub(crate) ready: bool,
}

impl Pollable {
    /// Returns whether this pollable has already observed readiness.
    pub fn is_ready(&self) -> bool {
        self.ready
    }
}

/// A trait used internally within a [`Pollable`] to create a `pollable`
/// resource in `wasi:io/poll`.
///
/// The `ready` function is an `async fn` which resolves when the
/// implementation is ready. Using native `async` Rust enables this type's
/// readiness to compose with other types' readiness throughout the shim.
///
/// # Example
///
/// ```
/// use preview_shim_io::{ResourceTable, Resource, Pollable, Subscribe, subscribe, async_trait};
/// use tokio::time::{Duration, Instant};
///
/// fn sleep(table: &mut ResourceTable, dur: Duration) -> anyhow::Result<Resource<Pollable>> {
///     let sleep = MySleep { end: Instant::now() + dur };
///     let sleep_resource = table.push(sleep)?;
///     subscribe(table, sleep_resource)
/// }
///
/// struct MySleep {
///     end: Instant,
/// }
///
/// #[async_trait]
/// impl Subscribe for MySleep {
///     async fn ready(&mut self) {
///         tokio::time::sleep_until(self.end).await;
///     }
/// }
/// ```
#[async_trait::async_trait]
pub trait Subscribe: Send + 'static {
    /// An asynchronous function which resolves when this object's readiness
    /// operation is ready.
    ///
    /// Note that this method does not return an error. Errors are reported
    /// through accessors on the object this `pollable` is connected to.
    async fn ready(&mut self);
}

/// Creates a `pollable` resource which is subscribed to the provided
/// `resource`.
///
/// If `resource` is an owned resource then it will be deleted when the
/// returned resource is deleted. Otherwise the returned resource is a child
/// of the given `resource`: if the parent goes away first, the pollable
/// keeps answering with whatever readiness it already observed and traps on
/// any use that needs the parent.
pub fn subscribe<T>(table: &mut ResourceTable, resource: Resource<T>) -> Result<Resource<Pollable>>
where
    T: Subscribe,
{
    fn make_future<T>(stream: &mut dyn Any) -> Result<PollableFuture<'_>, TableError>
    where
        T: Subscribe,
    {
        match stream.downcast_mut::<T>() {
            Some(stream) => Ok(stream.ready()),
            None => Err(TableError::WrongType),
        }
    }

    let pollable = Pollable {
        index: resource.rep(),
        remove_index_on_delete: if resource.owned() {
            Some(|table, idx| {
                let resource = Resource::<T>::new_own(idx);
                table.delete(resource)?;
                Ok(())
            })
        } else {
            None
        },
        make_future: make_future::<T>,
        ready: false,
    };

    Ok(table.push_child(pollable, &resource)?)
}

/// Waits on a list of pollables, returning the indices of every member that
/// is ready once at least one of them is.
///
/// Pollables that already latched readiness count as ready without touching
/// their parents. An empty list returns an empty set straight away.
pub async fn poll_list(
    table: &mut ResourceTable,
    pollables: &[Resource<Pollable>],
) -> Result<Vec<u32>> {
    type ReadylistIndex = u32;

    if pollables.is_empty() {
        return Ok(Vec::new());
    }
    if let [single] = pollables {
        block(table, single).await?;
        return Ok(vec![0]);
    }

    let mut latched = Vec::new();
    let mut table_futures: HashMap<u32, (MakeFuture, Vec<ReadylistIndex>)> = HashMap::new();
    for (ix, p) in pollables.iter().enumerate() {
        let ix: u32 = ix.try_into()?;
        let pollable = table.get(p)?;
        if pollable.ready {
            latched.push(ix);
            continue;
        }
        let (_, list) = table_futures
            .entry(pollable.index)
            .or_insert((pollable.make_future, Vec::new()));
        list.push(ix);
    }

    let ready = {
        let mut futures: Vec<(PollableFuture<'_>, Vec<ReadylistIndex>)> = Vec::new();
        for (entry, (make_future, readylist_indices)) in table.iter_entries(table_futures) {
            let entry = entry?;
            futures.push((make_future(entry)?, readylist_indices));
        }

        struct PollList<'a> {
            elems: Vec<(PollableFuture<'a>, Vec<ReadylistIndex>)>,
            latched: Vec<ReadylistIndex>,
        }

        impl Future for PollList<'_> {
            type Output = Vec<u32>;

            fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
                let mut results = self.latched.clone();
                for (fut, readylist_indices) in self.elems.iter_mut() {
                    if fut.as_mut().poll(cx).is_ready() {
                        results.extend_from_slice(readylist_indices);
                    }
                }
                if results.is_empty() {
                    Poll::Pending
                } else {
                    results.sort_unstable();
                    Poll::Ready(results)
                }
            }
        }

        PollList {
            elems: futures,
            latched,
        }
        .await
    };

    for ix in ready.iter() {
        table.get_mut(&pollables[*ix as usize])?.ready = true;
    }
    Ok(ready)
}

/// Suspends until `pollable` is ready.
pub async fn block(table: &mut ResourceTable, pollable: &Resource<Pollable>) -> Result<()> {
    let (index, make_future) = {
        let p = table.get(pollable)?;
        if p.ready {
            return Ok(());
        }
        (p.index, p.make_future)
    };
    make_future(table.get_any_mut(index)?)?.await;
    table.get_mut(pollable)?.ready = true;
    Ok(())
}

/// Blocks the calling thread until `pollable` is ready.
///
/// This is the entry point for embedders without an async context of their
/// own; see [`in_tokio`](crate::runtime::in_tokio).
pub fn block_sync(table: &mut ResourceTable, pollable: &Resource<Pollable>) -> Result<()> {
    crate::runtime::in_tokio(block(table, pollable))
}

/// Checks, without suspending, whether `pollable` is ready.
pub fn ready(table: &mut ResourceTable, pollable: &Resource<Pollable>) -> Result<bool> {
    let (index, make_future) = {
        let p = table.get(pollable)?;
        if p.ready {
            return Ok(true);
        }
        (p.index, p.make_future)
    };
    let mut future = make_future(table.get_any_mut(index)?)?;
    let ready = crate::runtime::poll_noop(future.as_mut()).is_some();
    drop(future);
    if ready {
        table.get_mut(pollable)?.ready = true;
    }
    Ok(ready)
}

/// Removes `pollable` from the table, along with its parent if the pollable
/// owned it.
pub fn delete(table: &mut ResourceTable, pollable: Resource<Pollable>) -> Result<()> {
    let pollable = table.delete(pollable)?;
    if let Some(delete) = pollable.remove_index_on_delete {
        if table.contains(pollable.index) {
            delete(table, pollable.index)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;
    use tokio::sync::watch;

    struct Gate(watch::Receiver<bool>);

    #[async_trait::async_trait]
    impl Subscribe for Gate {
        async fn ready(&mut self) {
            loop {
                let open = *self.0.borrow();
                // An error means the sender is gone, which also counts as ready.
                if open || self.0.changed().await.is_err() {
                    return;
                }
            }
        }
    }

    fn gate(table: &mut ResourceTable) -> (watch::Sender<bool>, Resource<Gate>) {
        let (tx, rx) = watch::channel(false);
        (tx, table.push(Gate(rx)).unwrap())
    }

    #[test_log::test(tokio::test)]
    async fn readiness_is_latched() {
        let mut table = ResourceTable::new();
        let (tx, g) = gate(&mut table);
        let p = subscribe(&mut table, g.borrowed()).unwrap();
        assert!(!ready(&mut table, &p).unwrap());

        tx.send(true).unwrap();
        assert!(ready(&mut table, &p).unwrap());

        // Closing the gate again does not revert the pollable.
        tx.send(false).unwrap();
        assert!(ready(&mut table, &p).unwrap());
        block(&mut table, &p).await.unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn poll_returns_every_ready_index() {
        let mut table = ResourceTable::new();
        let (tx1, g1) = gate(&mut table);
        let (_tx2, g2) = gate(&mut table);
        let (tx3, g3) = gate(&mut table);
        let p1 = subscribe(&mut table, g1.borrowed()).unwrap();
        let p2 = subscribe(&mut table, g2.borrowed()).unwrap();
        let p3 = subscribe(&mut table, g3.borrowed()).unwrap();
        tx1.send(true).unwrap();
        tx3.send(true).unwrap();

        let list = [p1, p2, p3];
        let ready = tokio::time::timeout(Duration::from_secs(2), poll_list(&mut table, &list))
            .await
            .expect("poll should not wait for the pending member")
            .unwrap();
        assert_eq!(ready, [0, 2]);
    }

    #[test_log::test(tokio::test)]
    async fn poll_edge_cases() {
        let mut table = ResourceTable::new();
        assert!(poll_list(&mut table, &[]).await.unwrap().is_empty());

        let (tx, g) = gate(&mut table);
        let p = subscribe(&mut table, g.borrowed()).unwrap();
        tx.send(true).unwrap();
        assert_eq!(poll_list(&mut table, &[p]).await.unwrap(), [0]);
    }

    #[test_log::test(tokio::test)]
    async fn poll_groups_pollables_of_one_parent() {
        let mut table = ResourceTable::new();
        let (tx, g) = gate(&mut table);
        let a = subscribe(&mut table, g.borrowed()).unwrap();
        let b = subscribe(&mut table, g.borrowed()).unwrap();
        tx.send(true).unwrap();
        assert_eq!(poll_list(&mut table, &[a, b]).await.unwrap(), [0, 1]);
    }

    #[test_log::test(tokio::test)]
    async fn same_pollable_listed_twice() {
        let mut table = ResourceTable::new();
        let (tx, g) = gate(&mut table);
        let p = subscribe(&mut table, g.borrowed()).unwrap();
        let again = Resource::new_borrow(p.rep());
        tx.send(true).unwrap();
        assert_eq!(poll_list(&mut table, &[p, again]).await.unwrap(), [0, 1]);
    }

    #[test_log::test(tokio::test)]
    async fn orphaned_pollables() {
        let mut table = ResourceTable::new();
        let (tx, g) = gate(&mut table);
        let fired = subscribe(&mut table, g.borrowed()).unwrap();
        let waiting = subscribe(&mut table, g.borrowed()).unwrap();
        tx.send(true).unwrap();
        assert!(ready(&mut table, &fired).unwrap());

        table.delete(g).unwrap();

        // Already ready: still answers.
        assert!(ready(&mut table, &fired).unwrap());
        block(&mut table, &fired).await.unwrap();
        // Never observed readiness: its parent is gone, so this traps.
        assert!(ready(&mut table, &waiting).is_err());
        assert!(block(&mut table, &waiting).await.is_err());

        delete(&mut table, fired).unwrap();
        delete(&mut table, waiting).unwrap();
        assert!(table.is_empty());
    }

    #[test]
    fn block_sync_outside_a_runtime() {
        let mut table = ResourceTable::new();
        let (tx, g) = gate(&mut table);
        let p = subscribe(&mut table, g.borrowed()).unwrap();
        let opener = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(5));
            tx.send(true).unwrap();
        });
        block_sync(&mut table, &p).unwrap();
        assert!(table.get(&p).unwrap().is_ready());
        opener.join().unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn owned_subscription_deletes_parent() {
        let mut table = ResourceTable::new();
        let (_tx, g) = gate(&mut table);
        let p = subscribe(&mut table, g).unwrap();
        assert_eq!(table.len(), 2);
        delete(&mut table, p).unwrap();
        assert!(table.is_empty());
    }
}

use preview_shim_io::{IoImpl, IoView, ResourceTable};
use std::time::Duration;

mod p3;
mod poll;
mod streams;

struct Ctx {
    table: ResourceTable,
}

impl Ctx {
    fn new() -> Self {
        Ctx {
            table: ResourceTable::new(),
        }
    }

    fn host(&mut self) -> IoImpl<&mut Ctx> {
        IoImpl(self)
    }
}

impl IoView for Ctx {
    fn table(&mut self) -> &mut ResourceTable {
        &mut self.table
    }
}

async fn resolves_immediately<F: std::future::Future>(fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(2), fut)
        .await
        .expect("operation timed out")
}

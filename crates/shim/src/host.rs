use crate::bindings::wasi::cli::{environment, stderr, stdin, stdout};
use crate::bindings::wasi::clocks::{monotonic_clock, wall_clock};
use crate::clocks::{Datetime, subscribe_duration, subscribe_instant};
use crate::ctx::WasiCtxView;
use preview_shim_io::{DynInputStream, DynOutputStream, Pollable, Resource};
use std::time::Duration;

impl environment::Host for WasiCtxView<'_> {
    fn get_environment(&mut self) -> anyhow::Result<Vec<(String, String)>> {
        Ok(self.ctx.environment().to_vec())
    }

    fn get_arguments(&mut self) -> anyhow::Result<Vec<String>> {
        Ok(self.ctx.arguments().to_vec())
    }

    fn initial_cwd(&mut self) -> anyhow::Result<Option<String>> {
        Ok(self.ctx.initial_cwd().map(str::to_owned))
    }
}

impl stdin::Host for WasiCtxView<'_> {
    fn get_stdin(&mut self) -> anyhow::Result<Resource<DynInputStream>> {
        let stream: DynInputStream = self.ctx.stdin.p2_stream();
        Ok(self.table.push(stream)?)
    }
}

impl stdout::Host for WasiCtxView<'_> {
    fn get_stdout(&mut self) -> anyhow::Result<Resource<DynOutputStream>> {
        let stream: DynOutputStream = self.ctx.stdout.p2_stream();
        Ok(self.table.push(stream)?)
    }
}

impl stderr::Host for WasiCtxView<'_> {
    fn get_stderr(&mut self) -> anyhow::Result<Resource<DynOutputStream>> {
        let stream: DynOutputStream = self.ctx.stderr.p2_stream();
        Ok(self.table.push(stream)?)
    }
}

impl monotonic_clock::Host for WasiCtxView<'_> {
    fn now(&mut self) -> anyhow::Result<monotonic_clock::Instant> {
        Ok(self.ctx.monotonic_clock.now())
    }

    fn resolution(&mut self) -> anyhow::Result<monotonic_clock::Duration> {
        Ok(self.ctx.monotonic_clock.resolution())
    }

    fn subscribe_instant(
        &mut self,
        when: monotonic_clock::Instant,
    ) -> anyhow::Result<Resource<Pollable>> {
        subscribe_instant(self.table, &*self.ctx.monotonic_clock, when)
    }

    fn subscribe_duration(
        &mut self,
        duration: monotonic_clock::Duration,
    ) -> anyhow::Result<Resource<Pollable>> {
        subscribe_duration(self.table, Duration::from_nanos(duration))
    }
}

impl wall_clock::Host for WasiCtxView<'_> {
    fn now(&mut self) -> anyhow::Result<Datetime> {
        Ok(self.ctx.wall_clock.now().into())
    }

    fn resolution(&mut self) -> anyhow::Result<Datetime> {
        Ok(self.ctx.wall_clock.resolution().into())
    }
}

#[cfg(test)]
mod test {
    use crate::bindings::wasi::cli::{environment::Host as _, stdin::Host as _, stdout::Host as _};
    use crate::bindings::wasi::clocks::monotonic_clock::Host as _;
    use crate::bindings::wasi::io::streams::{HostInputStream, HostOutputStream};
    use crate::{WasiCtxBuilder, WasiCtxView};
    use preview_shim_io::pipe::{MemoryInputPipe, MemoryOutputPipe};
    use preview_shim_io::{IoImpl, ResourceTable, poll};

    #[test_log::test(tokio::test)]
    async fn stdio_handles() {
        let out = MemoryOutputPipe::new(64);
        let mut ctx = WasiCtxBuilder::new()
            .stdin(MemoryInputPipe::new("in"))
            .stdout(out.clone())
            .env("K", "V")
            .build();
        let mut table = ResourceTable::new();
        let mut view = WasiCtxView {
            ctx: &mut ctx,
            table: &mut table,
        };

        assert_eq!(
            view.get_environment().unwrap(),
            vec![("K".to_string(), "V".to_string())]
        );

        let stdin = view.get_stdin().unwrap();
        let stdout = view.get_stdout().unwrap();
        let mut io = IoImpl(&mut view);
        let bytes = HostInputStream::blocking_read(&mut io, stdin.borrowed(), 10)
            .await
            .unwrap();
        assert_eq!(bytes, b"in");
        HostOutputStream::blocking_write_and_flush(&mut io, stdout.borrowed(), b"out".to_vec())
            .await
            .unwrap();
        assert_eq!(out.contents(), "out");
        HostInputStream::drop(&mut io, stdin).await.unwrap();
        HostOutputStream::drop(&mut io, stdout).await.unwrap();
        assert!(table.is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn clock_subscriptions() {
        let mut ctx = WasiCtxBuilder::new().build();
        let mut table = ResourceTable::new();
        let mut view = WasiCtxView {
            ctx: &mut ctx,
            table: &mut table,
        };
        let now = view.now().unwrap();
        let past = view.subscribe_instant(now).unwrap();
        let later = view.subscribe_duration(60_000_000_000).unwrap();
        assert!(poll::ready(view.table, &past).unwrap());
        assert!(!poll::ready(view.table, &later).unwrap());
    }
}

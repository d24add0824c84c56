use crate::bindings::wasi::io::{error, poll, streams};
use crate::poll::Pollable;
use crate::streams::{DynInputStream, DynOutputStream, StreamError, StreamResult};
use crate::table::Resource;
use crate::view::{IoImpl, IoView};

// Largest payload accepted by the blocking write convenience calls.
const MAX_BLOCKING_WRITE: usize = 4096;

#[async_trait::async_trait]
impl<T> poll::Host for IoImpl<T>
where
    T: IoView,
{
    async fn poll(&mut self, pollables: Vec<Resource<Pollable>>) -> anyhow::Result<Vec<u32>> {
        crate::poll::poll_list(self.table(), &pollables).await
    }
}

#[async_trait::async_trait]
impl<T> poll::HostPollable for IoImpl<T>
where
    T: IoView,
{
    async fn block(&mut self, pollable: Resource<Pollable>) -> anyhow::Result<()> {
        crate::poll::block(self.table(), &pollable).await
    }

    async fn ready(&mut self, pollable: Resource<Pollable>) -> anyhow::Result<bool> {
        crate::poll::ready(self.table(), &pollable)
    }

    fn drop(&mut self, pollable: Resource<Pollable>) -> anyhow::Result<()> {
        let table = self.table();
        if !table.contains(pollable.rep()) {
            tracing::debug!(rep = pollable.rep(), "pollable already dropped");
            return Ok(());
        }
        crate::poll::delete(table, pollable)
    }
}

impl<T> error::Host for IoImpl<T> where T: IoView {}

impl<T> error::HostError for IoImpl<T>
where
    T: IoView,
{
    fn drop(&mut self, err: Resource<error::Error>) -> anyhow::Result<()> {
        self.table().delete_if_present(err)?;
        Ok(())
    }

    fn to_debug_string(&mut self, err: Resource<error::Error>) -> anyhow::Result<String> {
        Ok(format!("{:?}", self.table().get(&err)?))
    }
}

impl<T> streams::Host for IoImpl<T>
where
    T: IoView,
{
    fn convert_stream_error(&mut self, err: StreamError) -> anyhow::Result<streams::StreamError> {
        match err {
            StreamError::Closed => Ok(streams::StreamError::Closed),
            StreamError::LastOperationFailed(e) => Ok(streams::StreamError::LastOperationFailed(
                self.table().push(e)?,
            )),
            StreamError::Trap(e) => Err(e),
        }
    }
}

#[async_trait::async_trait]
impl<T> streams::HostOutputStream for IoImpl<T>
where
    T: IoView,
{
    async fn drop(&mut self, stream: Resource<DynOutputStream>) -> anyhow::Result<()> {
        if let Some(mut stream) = self.table().delete_if_present(stream)? {
            stream.cancel().await;
        }
        Ok(())
    }

    fn check_write(&mut self, stream: Resource<DynOutputStream>) -> StreamResult<u64> {
        let bytes = self.table().get_mut(&stream)?.check_write()?;
        Ok(bytes as u64)
    }

    fn write(&mut self, stream: Resource<DynOutputStream>, bytes: Vec<u8>) -> StreamResult<()> {
        self.table().get_mut(&stream)?.write(bytes.into())?;
        Ok(())
    }

    fn subscribe(&mut self, stream: Resource<DynOutputStream>) -> anyhow::Result<Resource<Pollable>> {
        crate::poll::subscribe(self.table(), stream)
    }

    async fn blocking_write_and_flush(
        &mut self,
        stream: Resource<DynOutputStream>,
        bytes: Vec<u8>,
    ) -> StreamResult<()> {
        if bytes.len() > MAX_BLOCKING_WRITE {
            return Err(StreamError::trap(
                "Buffer too large for blocking-write-and-flush (expected at most 4096)",
            ));
        }

        self.table()
            .get_mut(&stream)?
            .blocking_write_and_flush(bytes.into())
            .await
    }

    async fn blocking_write_zeroes_and_flush(
        &mut self,
        stream: Resource<DynOutputStream>,
        len: u64,
    ) -> StreamResult<()> {
        if len > MAX_BLOCKING_WRITE as u64 {
            return Err(StreamError::trap(
                "Buffer too large for blocking-write-zeroes-and-flush (expected at most 4096)",
            ));
        }

        self.table()
            .get_mut(&stream)?
            .blocking_write_zeroes_and_flush(len as usize)
            .await
    }

    fn write_zeroes(&mut self, stream: Resource<DynOutputStream>, len: u64) -> StreamResult<()> {
        let len = len
            .try_into()
            .map_err(|_| StreamError::trap("write-zeroes length exceeds the address space"))?;
        self.table().get_mut(&stream)?.write_zeroes(len)?;
        Ok(())
    }

    fn flush(&mut self, stream: Resource<DynOutputStream>) -> StreamResult<()> {
        self.table().get_mut(&stream)?.flush()?;
        Ok(())
    }

    async fn blocking_flush(&mut self, stream: Resource<DynOutputStream>) -> StreamResult<()> {
        let s = self.table().get_mut(&stream)?;
        s.flush()?;
        s.write_ready().await?;
        Ok(())
    }

    fn splice(
        &mut self,
        dest: Resource<DynOutputStream>,
        src: Resource<DynInputStream>,
        len: u64,
    ) -> StreamResult<u64> {
        let len = len.try_into().unwrap_or(usize::MAX);

        let permit = self.table().get_mut(&dest)?.check_write()?;
        let len = len.min(permit);
        if len == 0 {
            return Ok(0);
        }

        let contents = self.table().get_mut(&src)?.read(len)?;

        let len = contents.len();
        if len == 0 {
            return Ok(0);
        }

        self.table().get_mut(&dest)?.write(contents)?;
        Ok(len as u64)
    }

    async fn blocking_splice(
        &mut self,
        dest: Resource<DynOutputStream>,
        src: Resource<DynInputStream>,
        len: u64,
    ) -> StreamResult<u64> {
        let len = len.try_into().unwrap_or(usize::MAX);

        let permit = self.table().get_mut(&dest)?.write_ready().await?;
        let len = len.min(permit);
        if len == 0 {
            return Ok(0);
        }

        let contents = self.table().get_mut(&src)?.blocking_read(len).await?;

        let len = contents.len();
        if len == 0 {
            return Ok(0);
        }

        self.table()
            .get_mut(&dest)?
            .blocking_write_and_flush(contents)
            .await?;
        Ok(len as u64)
    }
}

#[async_trait::async_trait]
impl<T> streams::HostInputStream for IoImpl<T>
where
    T: IoView,
{
    async fn drop(&mut self, stream: Resource<DynInputStream>) -> anyhow::Result<()> {
        if let Some(mut stream) = self.table().delete_if_present(stream)? {
            stream.cancel().await;
        }
        Ok(())
    }

    fn read(&mut self, stream: Resource<DynInputStream>, len: u64) -> StreamResult<Vec<u8>> {
        let len = len.try_into().unwrap_or(usize::MAX);
        let bytes = self.table().get_mut(&stream)?.read(len)?;
        debug_assert!(bytes.len() <= len);
        Ok(bytes.into())
    }

    async fn blocking_read(
        &mut self,
        stream: Resource<DynInputStream>,
        len: u64,
    ) -> StreamResult<Vec<u8>> {
        let len = len.try_into().unwrap_or(usize::MAX);
        let bytes = self.table().get_mut(&stream)?.blocking_read(len).await?;
        debug_assert!(bytes.len() <= len);
        Ok(bytes.into())
    }

    fn skip(&mut self, stream: Resource<DynInputStream>, len: u64) -> StreamResult<u64> {
        let len = len.try_into().unwrap_or(usize::MAX);
        let skipped = self.table().get_mut(&stream)?.skip(len)?;
        Ok(skipped as u64)
    }

    async fn blocking_skip(
        &mut self,
        stream: Resource<DynInputStream>,
        len: u64,
    ) -> StreamResult<u64> {
        let len = len.try_into().unwrap_or(usize::MAX);
        let skipped = self.table().get_mut(&stream)?.blocking_skip(len).await?;
        Ok(skipped as u64)
    }

    fn subscribe(&mut self, stream: Resource<DynInputStream>) -> anyhow::Result<Resource<Pollable>> {
        crate::poll::subscribe(self.table(), stream)
    }
}

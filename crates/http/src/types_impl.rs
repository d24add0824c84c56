//! Implementation for the `wasi:http/types` interface.

use crate::bindings::wasi::http::types::{
    self, Duration, FieldKey, FieldValue, FutureIncomingResponse, FutureTrailers, Headers,
    IncomingBody, IncomingResponse, OutgoingBody, OutgoingRequest, StatusCode, Trailers,
};
use crate::body::{HostFutureTrailers, HostOutgoingBody, StreamContext};
use crate::error::{ErrorCode, HeaderError, HttpError, HttpResult};
use crate::fields::{self, FieldMap};
use crate::types::{
    HostFields, HostFutureIncomingResponse, HostIncomingResponse, HostOutgoingRequest, Method,
    RequestOptions, Scheme, WasiHttpImpl, WasiHttpView, is_valid_authority,
    is_valid_path_with_query,
};
use preview_shim_io::bindings::wasi::io::error::Error;
use preview_shim_io::{DynInputStream, DynOutputStream, Pollable, Resource, ResourceTable};
use std::any::Any;

impl<T> types::Host for WasiHttpImpl<T>
where
    T: WasiHttpView,
{
    fn http_error_code(&mut self, err: Resource<Error>) -> anyhow::Result<Option<ErrorCode>> {
        let e = self.table().get(&err)?;
        Ok(e.downcast_ref::<ErrorCode>().cloned())
    }

    fn convert_error_code(&mut self, err: HttpError) -> anyhow::Result<ErrorCode> {
        err.downcast()
    }

    fn convert_header_error(&mut self, err: HttpError) -> anyhow::Result<HeaderError> {
        err.downcast()
    }
}

/// Get an immutable reference to the fields of `id`, following a reference
/// to a parent's fields.
fn get_fields<'a>(
    table: &'a mut ResourceTable,
    id: &Resource<HostFields>,
) -> anyhow::Result<&'a mut FieldMap> {
    if let HostFields::Ref { parent, get_fields } = *table.get(id)? {
        let entry = table.get_any_mut(parent)?;
        return get_fields(entry).ok_or_else(|| anyhow::anyhow!("fields parent has the wrong type"));
    }
    match table.get_mut(id)? {
        HostFields::Owned { fields } => Ok(fields),
        // This was checked above.
        HostFields::Ref { .. } => unreachable!(),
    }
}

/// Get a mutable reference to the fields of `id`, failing with `immutable`
/// for fields that belong to a request or response.
fn get_fields_mut<'a>(
    table: &'a mut ResourceTable,
    id: &Resource<HostFields>,
) -> HttpResult<&'a mut FieldMap> {
    match table.get_mut(id)? {
        HostFields::Owned { fields } => Ok(fields),
        HostFields::Ref { .. } => Err(HeaderError::Immutable.into()),
    }
}

/// Takes the fields of `id` out of the table. Fields that reference a
/// parent are copied.
fn move_fields(table: &mut ResourceTable, id: Resource<HostFields>) -> anyhow::Result<FieldMap> {
    match table.delete(id)? {
        HostFields::Ref { parent, get_fields } => {
            let entry = table.get_any_mut(parent)?;
            get_fields(entry)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("fields parent has the wrong type"))
        }
        HostFields::Owned { fields } => Ok(fields),
    }
}

fn request_headers<'a>(elem: &'a mut (dyn Any + 'static)) -> Option<&'a mut FieldMap> {
    elem.downcast_mut::<HostOutgoingRequest>()
        .map(|req| &mut req.headers)
}

fn response_headers<'a>(elem: &'a mut (dyn Any + 'static)) -> Option<&'a mut FieldMap> {
    elem.downcast_mut::<HostIncomingResponse>()
        .map(|resp| &mut resp.headers)
}

impl<T> types::HostFields for WasiHttpImpl<T>
where
    T: WasiHttpView,
{
    fn new(&mut self) -> anyhow::Result<Resource<HostFields>> {
        let id = self.table().push(HostFields::Owned {
            fields: FieldMap::new(),
        })?;
        Ok(id)
    }

    fn from_list(
        &mut self,
        entries: Vec<(FieldKey, FieldValue)>,
    ) -> HttpResult<Resource<HostFields>> {
        let fields = fields::from_list(self.ctx(), entries)?;
        Ok(self.table().push(HostFields::Owned { fields })?)
    }

    fn get(&mut self, this: Resource<HostFields>, name: FieldKey) -> anyhow::Result<Vec<FieldValue>> {
        Ok(fields::get(get_fields(self.table(), &this)?, &name))
    }

    fn has(&mut self, this: Resource<HostFields>, name: FieldKey) -> anyhow::Result<bool> {
        Ok(fields::has(get_fields(self.table(), &this)?, &name))
    }

    fn set(
        &mut self,
        this: Resource<HostFields>,
        name: FieldKey,
        values: Vec<FieldValue>,
    ) -> HttpResult<()> {
        let ctx = self.ctx().clone();
        fields::set(&ctx, get_fields_mut(self.table(), &this)?, &name, values)?;
        Ok(())
    }

    fn delete(&mut self, this: Resource<HostFields>, name: FieldKey) -> HttpResult<()> {
        self.get_and_delete(this, name)?;
        Ok(())
    }

    fn get_and_delete(
        &mut self,
        this: Resource<HostFields>,
        name: FieldKey,
    ) -> HttpResult<Vec<FieldValue>> {
        let ctx = self.ctx().clone();
        Ok(fields::get_and_delete(
            &ctx,
            get_fields_mut(self.table(), &this)?,
            &name,
        )?)
    }

    fn append(
        &mut self,
        this: Resource<HostFields>,
        name: FieldKey,
        value: FieldValue,
    ) -> HttpResult<()> {
        let ctx = self.ctx().clone();
        fields::append(&ctx, get_fields_mut(self.table(), &this)?, &name, &value)?;
        Ok(())
    }

    fn entries(&mut self, this: Resource<HostFields>) -> anyhow::Result<Vec<(FieldKey, FieldValue)>> {
        Ok(fields::entries(get_fields(self.table(), &this)?))
    }

    fn clone(&mut self, this: Resource<HostFields>) -> anyhow::Result<Resource<HostFields>> {
        let fields = get_fields(self.table(), &this)?.clone();
        let id = self.table().push(HostFields::Owned { fields })?;
        Ok(id)
    }

    fn drop(&mut self, this: Resource<HostFields>) -> anyhow::Result<()> {
        self.table().delete_if_present(this)?;
        Ok(())
    }
}

impl<T> types::HostOutgoingRequest for WasiHttpImpl<T>
where
    T: WasiHttpView,
{
    fn new(&mut self, headers: Resource<Headers>) -> anyhow::Result<Resource<OutgoingRequest>> {
        let headers = move_fields(self.table(), headers)?;
        let id = self.table().push(HostOutgoingRequest {
            method: Method::Get,
            scheme: None,
            authority: None,
            path_with_query: None,
            headers,
            body: None,
        })?;
        Ok(id)
    }

    fn body(
        &mut self,
        this: Resource<OutgoingRequest>,
    ) -> anyhow::Result<Result<Resource<OutgoingBody>, ()>> {
        let buffer_chunks = self.ctx().outgoing_body_buffer_chunks();
        let chunk_size = self.ctx().outgoing_body_chunk_size();
        let req = self.table().get_mut(&this)?;
        if req.body.is_some() {
            return Ok(Err(()));
        }

        // The value was validated when the header was set.
        let size = req
            .headers
            .get(http::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        let (host_body, hyper_body) =
            HostOutgoingBody::new(StreamContext::Request, size, buffer_chunks, chunk_size);
        req.body = Some(hyper_body);

        // The output body is a separate resource so that it may outlive the
        // request it was taken from.
        let outgoing_body = self.table().push(host_body)?;
        Ok(Ok(outgoing_body))
    }

    fn method(&mut self, this: Resource<OutgoingRequest>) -> anyhow::Result<Method> {
        Ok(self.table().get(&this)?.method.clone())
    }

    fn set_method(
        &mut self,
        this: Resource<OutgoingRequest>,
        method: Method,
    ) -> anyhow::Result<Result<(), ()>> {
        if http::Method::try_from(method.clone()).is_err() {
            return Ok(Err(()));
        }
        self.table().get_mut(&this)?.method = method;
        Ok(Ok(()))
    }

    fn path_with_query(&mut self, this: Resource<OutgoingRequest>) -> anyhow::Result<Option<String>> {
        Ok(self.table().get(&this)?.path_with_query.clone())
    }

    fn set_path_with_query(
        &mut self,
        this: Resource<OutgoingRequest>,
        path_with_query: Option<String>,
    ) -> anyhow::Result<Result<(), ()>> {
        if let Some(path) = &path_with_query {
            if !is_valid_path_with_query(path) {
                return Ok(Err(()));
            }
        }
        self.table().get_mut(&this)?.path_with_query = path_with_query;
        Ok(Ok(()))
    }

    fn scheme(&mut self, this: Resource<OutgoingRequest>) -> anyhow::Result<Option<Scheme>> {
        Ok(self.table().get(&this)?.scheme.clone())
    }

    fn set_scheme(
        &mut self,
        this: Resource<OutgoingRequest>,
        scheme: Option<Scheme>,
    ) -> anyhow::Result<Result<(), ()>> {
        if let Some(scheme) = &scheme {
            if http::uri::Scheme::try_from(scheme.clone()).is_err() {
                return Ok(Err(()));
            }
        }
        self.table().get_mut(&this)?.scheme = scheme;
        Ok(Ok(()))
    }

    fn authority(&mut self, this: Resource<OutgoingRequest>) -> anyhow::Result<Option<String>> {
        Ok(self.table().get(&this)?.authority.clone())
    }

    fn set_authority(
        &mut self,
        this: Resource<OutgoingRequest>,
        authority: Option<String>,
    ) -> anyhow::Result<Result<(), ()>> {
        if let Some(authority) = &authority {
            if !is_valid_authority(authority) {
                return Ok(Err(()));
            }
        }
        self.table().get_mut(&this)?.authority = authority;
        Ok(Ok(()))
    }

    fn headers(&mut self, this: Resource<OutgoingRequest>) -> anyhow::Result<Resource<Headers>> {
        let id = self.table().push_child(
            HostFields::Ref {
                parent: this.rep(),
                get_fields: request_headers,
            },
            &this,
        )?;
        Ok(id)
    }

    fn drop(&mut self, this: Resource<OutgoingRequest>) -> anyhow::Result<()> {
        self.table().delete_if_present(this)?;
        Ok(())
    }
}

fn duration_from_nanos(duration: Option<Duration>) -> Option<std::time::Duration> {
    duration.map(std::time::Duration::from_nanos)
}

fn duration_to_nanos(duration: Option<std::time::Duration>) -> Option<Duration> {
    duration.map(|d| d.as_nanos().try_into().unwrap_or(u64::MAX))
}

impl<T> types::HostRequestOptions for WasiHttpImpl<T>
where
    T: WasiHttpView,
{
    fn new(&mut self) -> anyhow::Result<Resource<RequestOptions>> {
        let id = self.table().push(RequestOptions::default())?;
        Ok(id)
    }

    fn connect_timeout(&mut self, this: Resource<RequestOptions>) -> anyhow::Result<Option<Duration>> {
        Ok(duration_to_nanos(self.table().get(&this)?.connect_timeout))
    }

    fn set_connect_timeout(
        &mut self,
        this: Resource<RequestOptions>,
        duration: Option<Duration>,
    ) -> anyhow::Result<Result<(), ()>> {
        self.table().get_mut(&this)?.connect_timeout = duration_from_nanos(duration);
        Ok(Ok(()))
    }

    fn first_byte_timeout(
        &mut self,
        this: Resource<RequestOptions>,
    ) -> anyhow::Result<Option<Duration>> {
        Ok(duration_to_nanos(self.table().get(&this)?.first_byte_timeout))
    }

    fn set_first_byte_timeout(
        &mut self,
        this: Resource<RequestOptions>,
        duration: Option<Duration>,
    ) -> anyhow::Result<Result<(), ()>> {
        self.table().get_mut(&this)?.first_byte_timeout = duration_from_nanos(duration);
        Ok(Ok(()))
    }

    fn between_bytes_timeout(
        &mut self,
        this: Resource<RequestOptions>,
    ) -> anyhow::Result<Option<Duration>> {
        Ok(duration_to_nanos(self.table().get(&this)?.between_bytes_timeout))
    }

    fn set_between_bytes_timeout(
        &mut self,
        this: Resource<RequestOptions>,
        duration: Option<Duration>,
    ) -> anyhow::Result<Result<(), ()>> {
        self.table().get_mut(&this)?.between_bytes_timeout = duration_from_nanos(duration);
        Ok(Ok(()))
    }

    fn drop(&mut self, this: Resource<RequestOptions>) -> anyhow::Result<()> {
        self.table().delete_if_present(this)?;
        Ok(())
    }
}

impl<T> types::HostIncomingResponse for WasiHttpImpl<T>
where
    T: WasiHttpView,
{
    fn status(&mut self, this: Resource<IncomingResponse>) -> anyhow::Result<StatusCode> {
        Ok(self.table().get(&this)?.status)
    }

    fn headers(&mut self, this: Resource<IncomingResponse>) -> anyhow::Result<Resource<Headers>> {
        let id = self.table().push_child(
            HostFields::Ref {
                parent: this.rep(),
                get_fields: response_headers,
            },
            &this,
        )?;
        Ok(id)
    }

    fn consume(
        &mut self,
        this: Resource<IncomingResponse>,
    ) -> anyhow::Result<Result<Resource<IncomingBody>, ()>> {
        let resp = self.table().get_mut(&this)?;
        match resp.body.take() {
            // The body keeps the connection alive on its own, so it is not a
            // child of the response.
            Some(body) => Ok(Ok(self.table().push(body)?)),
            None => Ok(Err(())),
        }
    }

    fn drop(&mut self, this: Resource<IncomingResponse>) -> anyhow::Result<()> {
        self.table().delete_if_present(this)?;
        Ok(())
    }
}

impl<T> types::HostIncomingBody for WasiHttpImpl<T>
where
    T: WasiHttpView,
{
    fn stream(
        &mut self,
        this: Resource<IncomingBody>,
    ) -> anyhow::Result<Result<Resource<DynInputStream>, ()>> {
        let body = self.table().get_mut(&this)?;
        match body.take_stream() {
            Some(stream) => {
                let stream: DynInputStream = Box::new(stream);
                Ok(Ok(self.table().push_child(stream, &this)?))
            }
            None => Ok(Err(())),
        }
    }

    fn finish(&mut self, this: Resource<IncomingBody>) -> anyhow::Result<Resource<FutureTrailers>> {
        let body = self.table().delete(this)?;
        let id = self.table().push(body.into_future_trailers())?;
        Ok(id)
    }

    fn drop(&mut self, this: Resource<IncomingBody>) -> anyhow::Result<()> {
        self.table().delete_if_present(this)?;
        Ok(())
    }
}

impl<T> types::HostFutureTrailers for WasiHttpImpl<T>
where
    T: WasiHttpView,
{
    fn subscribe(&mut self, this: Resource<FutureTrailers>) -> anyhow::Result<Resource<Pollable>> {
        preview_shim_io::subscribe(self.table(), this)
    }

    fn get(
        &mut self,
        this: Resource<FutureTrailers>,
    ) -> anyhow::Result<Option<Result<Result<Option<Resource<Trailers>>, ErrorCode>, ()>>> {
        let trailers = self.table().get_mut(&this)?;
        match trailers {
            HostFutureTrailers::Waiting(_) => return Ok(None),
            HostFutureTrailers::Consumed => return Ok(Some(Err(()))),
            HostFutureTrailers::Done(_) => {}
        };

        let fields = match std::mem::replace(trailers, HostFutureTrailers::Consumed) {
            HostFutureTrailers::Done(Ok(Some(fields))) => fields,
            HostFutureTrailers::Done(Ok(None)) => return Ok(Some(Ok(Ok(None)))),
            HostFutureTrailers::Done(Err(e)) => return Ok(Some(Ok(Err(e)))),
            HostFutureTrailers::Waiting(_) | HostFutureTrailers::Consumed => {
                // Both were handled above.
                return Ok(None);
            }
        };

        let ts = self.table().push(HostFields::Owned { fields })?;
        Ok(Some(Ok(Ok(Some(ts)))))
    }

    fn drop(&mut self, this: Resource<FutureTrailers>) -> anyhow::Result<()> {
        self.table().delete_if_present(this)?;
        Ok(())
    }
}

impl<T> types::HostOutgoingBody for WasiHttpImpl<T>
where
    T: WasiHttpView,
{
    fn write(
        &mut self,
        this: Resource<OutgoingBody>,
    ) -> anyhow::Result<Result<Resource<DynOutputStream>, ()>> {
        let body = self.table().get_mut(&this)?;
        match body.take_output_stream() {
            Some(stream) => Ok(Ok(self.table().push_child(stream, &this)?)),
            None => Ok(Err(())),
        }
    }

    fn finish(
        &mut self,
        this: Resource<OutgoingBody>,
        trailers: Option<Resource<Trailers>>,
    ) -> HttpResult<()> {
        let body = self.table().delete(this)?;
        let trailers = trailers
            .map(|trailers| move_fields(self.table(), trailers))
            .transpose()?;
        body.finish(trailers)?;
        Ok(())
    }

    fn drop(&mut self, this: Resource<OutgoingBody>) -> anyhow::Result<()> {
        // Dropping an unfinished body aborts it.
        self.table().delete_if_present(this)?;
        Ok(())
    }
}

impl<T> types::HostFutureIncomingResponse for WasiHttpImpl<T>
where
    T: WasiHttpView,
{
    fn subscribe(
        &mut self,
        this: Resource<FutureIncomingResponse>,
    ) -> anyhow::Result<Resource<Pollable>> {
        preview_shim_io::subscribe(self.table(), this)
    }

    fn get(
        &mut self,
        this: Resource<FutureIncomingResponse>,
    ) -> anyhow::Result<Option<Result<Result<Resource<IncomingResponse>, ErrorCode>, ()>>> {
        let resp = self.table().get_mut(&this)?;
        if matches!(resp, HostFutureIncomingResponse::Consumed) {
            return Ok(Some(Err(())));
        }
        let Some(result) = resp.take_ready() else {
            return Ok(None);
        };

        let resp = match result {
            // Trapping if it's not possible to downcast to a wasi-http error.
            Err(e) => return Ok(Some(Ok(Err(e.downcast::<ErrorCode>()?)))),
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) => return Ok(Some(Ok(Err(e)))),
        };

        let resp = resp.into_host(self.ctx());
        let resp = self.table().push(resp)?;
        Ok(Some(Ok(Ok(resp))))
    }

    fn drop(&mut self, this: Resource<FutureIncomingResponse>) -> anyhow::Result<()> {
        self.table().delete_if_present(this)?;
        Ok(())
    }
}

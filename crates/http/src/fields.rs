//! Header and trailer fields.
//!
//! Fields are an ordered multimap from case-insensitive names to byte-string
//! values, stored as a [`FieldMap`]. Every mutation validates the name and
//! value first and checks the name against the forbidden set of the
//! [`WasiHttpCtx`]; nothing is modified when validation fails.

use crate::error::HeaderError;
use crate::types::WasiHttpCtx;
use http::header::{CONTENT_LENGTH, HeaderName, HeaderValue};

/// The backing map of a set of fields.
pub type FieldMap = http::HeaderMap;

/// Parses `name`, rejecting invalid syntax and forbidden names.
pub fn parse_header_name(ctx: &WasiHttpCtx, name: &str) -> Result<HeaderName, HeaderError> {
    let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| HeaderError::InvalidSyntax)?;
    if ctx.is_forbidden_header(&name) {
        return Err(HeaderError::Forbidden);
    }
    Ok(name)
}

/// Parses `value` for the header `name`.
///
/// A `content-length` value must also be a valid decimal length.
pub fn parse_header_value(name: &HeaderName, value: &[u8]) -> Result<HeaderValue, HeaderError> {
    if name == CONTENT_LENGTH {
        let s = std::str::from_utf8(value).map_err(|_| HeaderError::InvalidSyntax)?;
        let v: u64 = s.parse().map_err(|_| HeaderError::InvalidSyntax)?;
        Ok(HeaderValue::from(v))
    } else {
        HeaderValue::from_bytes(value).map_err(|_| HeaderError::InvalidSyntax)
    }
}

/// Builds a map from `entries`, failing as a whole on the first invalid or
/// forbidden entry.
pub fn from_list(
    ctx: &WasiHttpCtx,
    entries: impl IntoIterator<Item = (String, Vec<u8>)>,
) -> Result<FieldMap, HeaderError> {
    let mut fields = FieldMap::new();
    for (name, value) in entries {
        let name = parse_header_name(ctx, &name)?;
        let value = parse_header_value(&name, &value)?;
        fields.append(name, value);
    }
    Ok(fields)
}

/// All values of `name`, in the order they were added.
///
/// Invalid names have no values.
pub fn get(fields: &FieldMap, name: &str) -> Vec<Vec<u8>> {
    let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
        return Vec::new();
    };
    fields
        .get_all(name)
        .into_iter()
        .map(|v| v.as_bytes().to_vec())
        .collect()
}

pub fn has(fields: &FieldMap, name: &str) -> bool {
    match HeaderName::from_bytes(name.as_bytes()) {
        Ok(name) => fields.contains_key(name),
        Err(_) => false,
    }
}

/// Replaces every value of `name` with `values`.
pub fn set(
    ctx: &WasiHttpCtx,
    fields: &mut FieldMap,
    name: &str,
    values: Vec<Vec<u8>>,
) -> Result<(), HeaderError> {
    let name = parse_header_name(ctx, name)?;
    let values = values
        .iter()
        .map(|value| parse_header_value(&name, value))
        .collect::<Result<Vec<_>, _>>()?;
    fields.remove(&name);
    for value in values {
        fields.append(&name, value);
    }
    Ok(())
}

pub fn append(
    ctx: &WasiHttpCtx,
    fields: &mut FieldMap,
    name: &str,
    value: &[u8],
) -> Result<(), HeaderError> {
    let name = parse_header_name(ctx, name)?;
    let value = parse_header_value(&name, value)?;
    fields.append(name, value);
    Ok(())
}

/// Removes `name`, returning the values it had.
pub fn get_and_delete(
    ctx: &WasiHttpCtx,
    fields: &mut FieldMap,
    name: &str,
) -> Result<Vec<Vec<u8>>, HeaderError> {
    let name = parse_header_name(ctx, name)?;
    let http::header::Entry::Occupied(entry) = fields.entry(name) else {
        return Ok(Vec::new());
    };
    let (_, values) = entry.remove_entry_mult();
    Ok(values.map(|v| v.as_bytes().to_vec()).collect())
}

/// Every name/value pair, names in first-insertion order.
pub fn entries(fields: &FieldMap) -> Vec<(String, Vec<u8>)> {
    fields
        .iter()
        .map(|(name, value)| (name.as_str().to_owned(), value.as_bytes().to_vec()))
        .collect()
}

/// Drops every forbidden entry from `fields`.
pub fn remove_forbidden_headers(ctx: &WasiHttpCtx, fields: &mut FieldMap) {
    let forbidden = fields
        .keys()
        .filter(|name| ctx.is_forbidden_header(name))
        .cloned()
        .collect::<Vec<_>>();
    for name in forbidden {
        fields.remove(name);
    }
}

/// A set of fields with an immutability flag, as owned by a request or
/// response or handed out on its own.
///
/// Once immutable, every mutator fails with [`HeaderError::Immutable`].
#[derive(Debug, Clone, Default)]
pub struct Fields {
    map: FieldMap,
    immutable: bool,
}

impl Fields {
    /// Empty, mutable fields.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_list(
        ctx: &WasiHttpCtx,
        entries: impl IntoIterator<Item = (String, Vec<u8>)>,
    ) -> Result<Self, HeaderError> {
        Ok(Self {
            map: from_list(ctx, entries)?,
            immutable: false,
        })
    }

    /// Wraps an existing map as immutable fields.
    pub fn immutable(map: FieldMap) -> Self {
        Self {
            map,
            immutable: true,
        }
    }

    pub fn is_immutable(&self) -> bool {
        self.immutable
    }

    pub(crate) fn freeze(&mut self) {
        self.immutable = true;
    }

    pub fn get(&self, name: &str) -> Vec<Vec<u8>> {
        get(&self.map, name)
    }

    pub fn has(&self, name: &str) -> bool {
        has(&self.map, name)
    }

    pub fn entries(&self) -> Vec<(String, Vec<u8>)> {
        entries(&self.map)
    }

    pub fn set(
        &mut self,
        ctx: &WasiHttpCtx,
        name: &str,
        values: Vec<Vec<u8>>,
    ) -> Result<(), HeaderError> {
        set(ctx, self.map_mut()?, name, values)
    }

    pub fn append(&mut self, ctx: &WasiHttpCtx, name: &str, value: &[u8]) -> Result<(), HeaderError> {
        append(ctx, self.map_mut()?, name, value)
    }

    pub fn delete(&mut self, ctx: &WasiHttpCtx, name: &str) -> Result<(), HeaderError> {
        get_and_delete(ctx, self.map_mut()?, name)?;
        Ok(())
    }

    pub fn get_and_delete(
        &mut self,
        ctx: &WasiHttpCtx,
        name: &str,
    ) -> Result<Vec<Vec<u8>>, HeaderError> {
        get_and_delete(ctx, self.map_mut()?, name)
    }

    /// A mutable deep copy, regardless of whether `self` is immutable.
    pub fn copy_all(&self) -> Fields {
        Fields {
            map: self.map.clone(),
            immutable: false,
        }
    }

    pub fn as_map(&self) -> &FieldMap {
        &self.map
    }

    pub fn into_map(self) -> FieldMap {
        self.map
    }

    fn map_mut(&mut self) -> Result<&mut FieldMap, HeaderError> {
        if self.immutable {
            Err(HeaderError::Immutable)
        } else {
            Ok(&mut self.map)
        }
    }
}

//! Raw memory helpers of the entry points
//!
//! Everything here trusts the host for the validity of non-null pointers and
//! the lengths next to them, as Cryptoki requires.

use std::slice;

use pkcs11_sys::*;

use crate::error::{ErrorKind, Result};
use crate::object::{Attribute, AttributeValue};

/// Fail with `CKR_ARGUMENTS_BAD` when a pointer argument is null
macro_rules! not_null {
    ($ptr:expr) => {
        if $ptr.is_null() {
            return Err($crate::error::ErrorKind::ArgumentsBad(concat!(
                stringify!($ptr),
                " is a null pointer"
            ))
            .into());
        }
    };
}
pub(crate) use not_null;

/// Blank-padded Cryptoki text field, cut at a character boundary
pub(crate) fn padded<const N: usize>(text: &str) -> [CK_UTF8CHAR; N] {
    let mut field = [b' '; N];
    let mut end = text.len().min(N);
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    field[..end].copy_from_slice(&text.as_bytes()[..end]);
    field
}

/// Version of this library
pub(crate) fn library_version() -> CK_VERSION {
    CK_VERSION {
        major: env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0),
        minor: env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(0),
    }
}

/// Borrow `len` bytes at `data`
///
/// # Safety
///
/// `data` must be null or point to `len` readable bytes that outlive `'a`.
pub(crate) unsafe fn input<'a>(data: *const CK_BYTE, len: CK_ULONG) -> Result<&'a [u8]> {
    if len == 0 {
        return Ok(&[]);
    }
    not_null!(data);
    Ok(unsafe { slice::from_raw_parts(data, usize::try_from(len)?) })
}

/// Mechanism type of an init call, `None` for a null mechanism
///
/// # Safety
///
/// `mechanism` must be null or point to a valid `CK_MECHANISM`.
pub(crate) unsafe fn mechanism(mechanism: CK_MECHANISM_PTR) -> Result<Option<CK_MECHANISM_TYPE>> {
    if mechanism.is_null() {
        return Ok(None);
    }
    let mechanism = unsafe { &*mechanism };
    // none of the RSA PKCS#1 mechanisms take a parameter
    if !mechanism.pParameter.is_null() || mechanism.ulParameterLen != 0 {
        return Err(ErrorKind::MechanismParamInvalid.into());
    }
    Ok(Some(mechanism.mechanism))
}

/// View the template at `template` mutably
///
/// # Safety
///
/// `template` must be null or point to `count` valid `CK_ATTRIBUTE`s that
/// outlive `'a`.
pub(crate) unsafe fn template<'a>(template: CK_ATTRIBUTE_PTR, count: CK_ULONG) -> Result<&'a mut [CK_ATTRIBUTE]> {
    if count == 0 {
        return Ok(&mut []);
    }
    not_null!(template);
    Ok(unsafe { slice::from_raw_parts_mut(template, usize::try_from(count)?) })
}

/// Copy a search template out of host memory
///
/// # Safety
///
/// As for [`template`], and every non-null `pValue` must point to
/// `ulValueLen` readable bytes.
pub(crate) unsafe fn read_template(pointer: CK_ATTRIBUTE_PTR, count: CK_ULONG) -> Result<Vec<Attribute>> {
    let entries = unsafe { template(pointer, count)? };
    entries
        .iter()
        .map(|entry| {
            let value = unsafe { input(entry.pValue.cast::<CK_BYTE>(), entry.ulValueLen)? };
            Ok(Attribute::bytes(entry.type_, value))
        })
        .collect()
}

/// Fill one template entry from `value`, returning the error it reports
///
/// # Safety
///
/// A non-null `pValue` must point to `ulValueLen` writable bytes.
unsafe fn fill_attribute(entry: &mut CK_ATTRIBUTE, value: &AttributeValue) -> Result<Option<ErrorKind>> {
    let AttributeValue::Available(bytes) = value else {
        entry.ulValueLen = CK_UNAVAILABLE_INFORMATION;
        return Ok(value.error(entry.type_));
    };
    let len = CK_ULONG::try_from(bytes.len())?;
    if entry.pValue.is_null() {
        entry.ulValueLen = len;
        return Ok(None);
    }
    if entry.ulValueLen < len {
        entry.ulValueLen = CK_UNAVAILABLE_INFORMATION;
        return Ok(Some(ErrorKind::BufferTooSmall { required: bytes.len() }));
    }
    unsafe { slice::from_raw_parts_mut(entry.pValue.cast::<u8>(), bytes.len()) }.copy_from_slice(bytes);
    entry.ulValueLen = len;
    Ok(None)
}

/// Fill `template` with `values`, one per entry
///
/// Every entry is processed. The first failure in template order is
/// returned after all of them are written.
///
/// # Safety
///
/// As for [`fill_attribute`], for every entry.
pub(crate) unsafe fn fill_attributes(template: &mut [CK_ATTRIBUTE], values: &[AttributeValue]) -> Result<()> {
    let mut first = None;
    for (entry, value) in template.iter_mut().zip(values) {
        let failure = unsafe { fill_attribute(entry, value)? };
        if first.is_none() {
            first = failure;
        }
    }
    first.map_or(Ok(()), |kind| Err(kind.into()))
}

/// Publish the length of an output and tell whether the output must be
/// written
///
/// A null `buffer` is a length probe. A buffer smaller than `required`
/// fails with [`ErrorKind::BufferTooSmall`] and leaves the operation alone.
///
/// # Safety
///
/// `len` must be null or point to a writable `CK_ULONG`.
pub(crate) unsafe fn reserve<T>(buffer: *mut T, len: CK_ULONG_PTR, required: usize) -> Result<bool> {
    not_null!(len);
    let capacity = unsafe { *len };
    unsafe { *len = CK_ULONG::try_from(required)? };
    if buffer.is_null() {
        return Ok(false);
    }
    if usize::try_from(capacity)? < required {
        return Err(ErrorKind::BufferTooSmall { required }.into());
    }
    Ok(true)
}

/// Two-phase output of a list
///
/// # Safety
///
/// `len` as for [`reserve`]; a non-null `buffer` must point to `*len`
/// writable elements.
pub(crate) unsafe fn write_output<T: Copy>(buffer: *mut T, len: CK_ULONG_PTR, items: &[T]) -> Result<()> {
    if unsafe { reserve(buffer, len, items.len())? } {
        unsafe { slice::from_raw_parts_mut(buffer, items.len()) }.copy_from_slice(items);
    }
    Ok(())
}

//! The exported Cryptoki entry points
//!
//! Each entry point unpacks its raw arguments, calls the [`Provider`] and
//! turns the outcome into a `CK_RV`. Panics are caught here and reported as
//! `CKR_GENERAL_ERROR`; nothing unwinds into the host.
#![allow(non_snake_case)]

mod util;

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::Arc;

use parking_lot::RwLock;
use pkcs11_sys::*;
use tracing::{error, warn};

use self::util::{not_null, padded};
use crate::config::ProviderConfig;
use crate::error::{ErrorKind, Result};
use crate::logging;
use crate::mechanism::Operation;
use crate::provider::{LIBRARY_DESCRIPTION, MANUFACTURER, Provider};
use crate::trail;

/// Provider of the process, set between initialize and finalize
static PROVIDER: RwLock<Option<Arc<Provider>>> = RwLock::new(None);

fn provider() -> Result<Arc<Provider>> {
    PROVIDER
        .read()
        .clone()
        .ok_or_else(|| ErrorKind::NotInitialized.into())
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

pub(crate) fn result_to_rv<F>(name: &'static str, f: F) -> CK_RV
where
    F: FnOnce() -> Result<()>,
{
    let _frame = trail::enter(name);
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => CKR_OK,
        Ok(Err(e)) => {
            e.log(name);
            e.rv()
        }
        Err(payload) => {
            error!(function = name, panic = panic_message(payload.as_ref()), "Entry point panicked");
            CKR_GENERAL_ERROR
        }
    }
}

macro_rules! cryptoki_fn {
    (fn $name:ident ( $($arg:ident : $type:ty),* $(,)?) $body:block) => {
        #[doc = concat!("Cryptoki `", stringify!($name), "`")]
        #[tracing::instrument(level = "trace", skip_all)]
        #[unsafe(no_mangle)]
        pub extern "C" fn $name($($arg: $type),*) -> CK_RV {
            result_to_rv(stringify!($name), || $body)
        }
    };
    (unsafe fn $name:ident ( $($arg:ident : $type:ty),* $(,)?) $body:block) => {
        #[doc = concat!("Cryptoki `", stringify!($name), "`")]
        ///
        /// # Safety
        ///
        /// Pointer arguments must follow the Cryptoki calling conventions.
        #[tracing::instrument(level = "trace", skip_all)]
        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn $name($($arg: $type),*) -> CK_RV {
            result_to_rv(stringify!($name), || $body)
        }
    };
}

macro_rules! cryptoki_fn_not_supported {
    ($name:ident, $($arg:ident: $type:ty),* $(,)?) => {
        cryptoki_fn!(fn $name($($arg: $type),*) {
            $(let _ = $arg;)*
            Err(ErrorKind::FunctionNotSupported.into())
        });
    };
}

static FUNCTION_LIST: CK_FUNCTION_LIST = CK_FUNCTION_LIST {
    version: CK_VERSION { major: 2, minor: 40 },
    C_Initialize: Some(C_Initialize),
    C_Finalize: Some(C_Finalize),
    C_GetInfo: Some(C_GetInfo),
    C_GetFunctionList: Some(C_GetFunctionList),
    C_GetSlotList: Some(C_GetSlotList),
    C_GetSlotInfo: Some(C_GetSlotInfo),
    C_GetTokenInfo: Some(C_GetTokenInfo),
    C_GetMechanismList: Some(C_GetMechanismList),
    C_GetMechanismInfo: Some(C_GetMechanismInfo),
    C_InitToken: Some(C_InitToken),
    C_InitPIN: Some(C_InitPIN),
    C_SetPIN: Some(C_SetPIN),
    C_OpenSession: Some(C_OpenSession),
    C_CloseSession: Some(C_CloseSession),
    C_CloseAllSessions: Some(C_CloseAllSessions),
    C_GetSessionInfo: Some(C_GetSessionInfo),
    C_GetOperationState: Some(C_GetOperationState),
    C_SetOperationState: Some(C_SetOperationState),
    C_Login: Some(C_Login),
    C_Logout: Some(C_Logout),
    C_CreateObject: Some(C_CreateObject),
    C_CopyObject: Some(C_CopyObject),
    C_DestroyObject: Some(C_DestroyObject),
    C_GetObjectSize: Some(C_GetObjectSize),
    C_GetAttributeValue: Some(C_GetAttributeValue),
    C_SetAttributeValue: Some(C_SetAttributeValue),
    C_FindObjectsInit: Some(C_FindObjectsInit),
    C_FindObjects: Some(C_FindObjects),
    C_FindObjectsFinal: Some(C_FindObjectsFinal),
    C_EncryptInit: Some(C_EncryptInit),
    C_Encrypt: Some(C_Encrypt),
    C_EncryptUpdate: Some(C_EncryptUpdate),
    C_EncryptFinal: Some(C_EncryptFinal),
    C_DecryptInit: Some(C_DecryptInit),
    C_Decrypt: Some(C_Decrypt),
    C_DecryptUpdate: Some(C_DecryptUpdate),
    C_DecryptFinal: Some(C_DecryptFinal),
    C_DigestInit: Some(C_DigestInit),
    C_Digest: Some(C_Digest),
    C_DigestUpdate: Some(C_DigestUpdate),
    C_DigestKey: Some(C_DigestKey),
    C_DigestFinal: Some(C_DigestFinal),
    C_SignInit: Some(C_SignInit),
    C_Sign: Some(C_Sign),
    C_SignUpdate: Some(C_SignUpdate),
    C_SignFinal: Some(C_SignFinal),
    C_SignRecoverInit: Some(C_SignRecoverInit),
    C_SignRecover: Some(C_SignRecover),
    C_VerifyInit: Some(C_VerifyInit),
    C_Verify: Some(C_Verify),
    C_VerifyUpdate: Some(C_VerifyUpdate),
    C_VerifyFinal: Some(C_VerifyFinal),
    C_VerifyRecoverInit: Some(C_VerifyRecoverInit),
    C_VerifyRecover: Some(C_VerifyRecover),
    C_DigestEncryptUpdate: Some(C_DigestEncryptUpdate),
    C_DecryptDigestUpdate: Some(C_DecryptDigestUpdate),
    C_SignEncryptUpdate: Some(C_SignEncryptUpdate),
    C_DecryptVerifyUpdate: Some(C_DecryptVerifyUpdate),
    C_GenerateKey: Some(C_GenerateKey),
    C_GenerateKeyPair: Some(C_GenerateKeyPair),
    C_WrapKey: Some(C_WrapKey),
    C_UnwrapKey: Some(C_UnwrapKey),
    C_DeriveKey: Some(C_DeriveKey),
    C_SeedRandom: Some(C_SeedRandom),
    C_GenerateRandom: Some(C_GenerateRandom),
    C_GetFunctionStatus: Some(C_GetFunctionStatus),
    C_CancelFunction: Some(C_CancelFunction),
    C_WaitForSlotEvent: Some(C_WaitForSlotEvent),
};

cryptoki_fn!(
    unsafe fn C_GetFunctionList(ppFunctionList: CK_FUNCTION_LIST_PTR_PTR) {
        not_null!(ppFunctionList);
        unsafe { *ppFunctionList = ptr::addr_of!(FUNCTION_LIST).cast_mut() };
        Ok(())
    }
);

// general purpose

/// Check the arguments of `C_Initialize`
///
/// The provider locks with native primitives, so application supplied mutex
/// callbacks are only acceptable together with `CKF_OS_LOCKING_OK`.
fn check_init_args(args: &CK_C_INITIALIZE_ARGS) -> Result<()> {
    if !args.pReserved.is_null() {
        return Err(ErrorKind::ArgumentsBad("pReserved must be null").into());
    }
    let callbacks = [
        args.CreateMutex.is_some(),
        args.DestroyMutex.is_some(),
        args.LockMutex.is_some(),
        args.UnlockMutex.is_some(),
    ];
    if callbacks.contains(&true) && callbacks.contains(&false) {
        return Err(ErrorKind::ArgumentsBad("mutex callbacks must be all set or all unset").into());
    }
    if callbacks[0] && args.flags & CKF_OS_LOCKING_OK == 0 {
        return Err(ErrorKind::CantLock.into());
    }
    Ok(())
}

cryptoki_fn!(
    unsafe fn C_Initialize(pInitArgs: CK_VOID_PTR) {
        if !pInitArgs.is_null() {
            check_init_args(unsafe { &*pInitArgs.cast::<CK_C_INITIALIZE_ARGS>() })?;
        }
        let mut global = PROVIDER.write();
        if global.is_some() {
            return Err(ErrorKind::AlreadyInitialized.into());
        }

        let (config, problem) = match ProviderConfig::load() {
            Ok(config) => (config, None),
            Err(e) => (ProviderConfig::default(), Some(e)),
        };
        logging::init(&config);
        if let Some(e) = problem {
            warn!(error = %e, "Invalid configuration, using the defaults");
        }

        *global = Some(Arc::new(Provider::new(config)?));
        Ok(())
    }
);

cryptoki_fn!(
    fn C_Finalize(pReserved: CK_VOID_PTR) {
        if !pReserved.is_null() {
            return Err(ErrorKind::ArgumentsBad("pReserved must be null").into());
        }
        let provider = PROVIDER.write().take().ok_or(ErrorKind::NotInitialized)?;
        provider.shutdown();
        Ok(())
    }
);

cryptoki_fn!(
    unsafe fn C_GetInfo(pInfo: CK_INFO_PTR) {
        provider()?;
        not_null!(pInfo);
        let info = CK_INFO {
            cryptokiVersion: CK_VERSION { major: 2, minor: 40 },
            manufacturerID: padded(MANUFACTURER),
            flags: 0,
            libraryDescription: padded(LIBRARY_DESCRIPTION),
            libraryVersion: util::library_version(),
        };
        unsafe { *pInfo = info };
        Ok(())
    }
);

// slots and tokens

cryptoki_fn!(
    unsafe fn C_GetSlotList(tokenPresent: CK_BBOOL, pSlotList: CK_SLOT_ID_PTR, pulCount: CK_ULONG_PTR) {
        let provider = provider()?;
        if pSlotList.is_null() {
            provider.update_slot_list()?;
        }
        let slots = provider.slot_list(tokenPresent != CK_FALSE);
        unsafe { util::write_output(pSlotList, pulCount, &slots) }
    }
);

cryptoki_fn!(
    fn C_UpdateSlotList() {
        provider()?.update_slot_list()
    }
);

cryptoki_fn!(
    unsafe fn C_GetSlotInfo(slotID: CK_SLOT_ID, pInfo: CK_SLOT_INFO_PTR) {
        let provider = provider()?;
        not_null!(pInfo);
        let slot = provider.slot_info(slotID)?;
        let mut flags = CKF_REMOVABLE_DEVICE | CKF_HW_SLOT;
        if slot.token_present {
            flags |= CKF_TOKEN_PRESENT;
        }
        let info = CK_SLOT_INFO {
            slotDescription: padded(&slot.description),
            manufacturerID: padded(&slot.manufacturer),
            flags,
            hardwareVersion: CK_VERSION { major: 0, minor: 0 },
            firmwareVersion: CK_VERSION { major: 0, minor: 0 },
        };
        unsafe { *pInfo = info };
        Ok(())
    }
);

cryptoki_fn!(
    unsafe fn C_GetTokenInfo(slotID: CK_SLOT_ID, pInfo: CK_TOKEN_INFO_PTR) {
        let provider = provider()?;
        not_null!(pInfo);
        let token = provider.token_info(slotID)?;
        let info = CK_TOKEN_INFO {
            label: padded(&token.label),
            manufacturerID: padded(&token.manufacturer),
            model: padded(&token.model),
            serialNumber: padded(&token.serial),
            flags: token.flags,
            ulMaxSessionCount: CK_UNAVAILABLE_INFORMATION,
            ulSessionCount: CK_ULONG::try_from(token.session_count)?,
            ulMaxRwSessionCount: CK_UNAVAILABLE_INFORMATION,
            ulRwSessionCount: CK_ULONG::try_from(token.rw_session_count)?,
            ulMaxPinLen: CK_ULONG::try_from(token.pin_len.1)?,
            ulMinPinLen: CK_ULONG::try_from(token.pin_len.0)?,
            ulTotalPublicMemory: CK_UNAVAILABLE_INFORMATION,
            ulFreePublicMemory: CK_UNAVAILABLE_INFORMATION,
            ulTotalPrivateMemory: CK_UNAVAILABLE_INFORMATION,
            ulFreePrivateMemory: CK_UNAVAILABLE_INFORMATION,
            hardwareVersion: CK_VERSION { major: 0, minor: 0 },
            firmwareVersion: CK_VERSION { major: 0, minor: 0 },
            utcTime: padded(""),
        };
        unsafe { *pInfo = info };
        Ok(())
    }
);

cryptoki_fn!(
    unsafe fn C_GetMechanismList(
        slotID: CK_SLOT_ID,
        pMechanismList: CK_MECHANISM_TYPE_PTR,
        pulCount: CK_ULONG_PTR,
    ) {
        let mechanisms = provider()?.mechanism_list(slotID)?;
        unsafe { util::write_output(pMechanismList, pulCount, &mechanisms) }
    }
);

cryptoki_fn!(
    unsafe fn C_GetMechanismInfo(slotID: CK_SLOT_ID, type_: CK_MECHANISM_TYPE, pInfo: CK_MECHANISM_INFO_PTR) {
        let provider = provider()?;
        not_null!(pInfo);
        let mechanism = provider.mechanism_info(slotID, type_)?;
        let info = CK_MECHANISM_INFO {
            ulMinKeySize: mechanism.min_key_bits,
            ulMaxKeySize: mechanism.max_key_bits,
            flags: mechanism.flags,
        };
        unsafe { *pInfo = info };
        Ok(())
    }
);

cryptoki_fn_not_supported!(
    C_InitToken,
    slotID: CK_SLOT_ID,
    pPin: CK_UTF8CHAR_PTR,
    ulPinLen: CK_ULONG,
    pLabel: CK_UTF8CHAR_PTR
);

cryptoki_fn!(
    unsafe fn C_WaitForSlotEvent(flags: CK_FLAGS, pSlot: CK_SLOT_ID_PTR, pReserved: CK_VOID_PTR) {
        let provider = provider()?;
        not_null!(pSlot);
        if !pReserved.is_null() {
            return Err(ErrorKind::ArgumentsBad("pReserved must be null").into());
        }
        let slot = provider.wait_for_slot_event(flags & CKF_DONT_BLOCK == 0)?;
        unsafe { *pSlot = slot };
        Ok(())
    }
);

// sessions

cryptoki_fn!(
    unsafe fn C_OpenSession(
        slotID: CK_SLOT_ID,
        flags: CK_FLAGS,
        pApplication: CK_VOID_PTR,
        Notify: CK_NOTIFY,
        phSession: CK_SESSION_HANDLE_PTR,
    ) {
        let provider = provider()?;
        not_null!(phSession);
        // notification callbacks are never invoked
        let _ = (pApplication, Notify);
        let session = provider.open_session(slotID, flags)?;
        unsafe { *phSession = session };
        Ok(())
    }
);

cryptoki_fn!(
    fn C_CloseSession(hSession: CK_SESSION_HANDLE) {
        provider()?.close_session(hSession)
    }
);

cryptoki_fn!(
    fn C_CloseAllSessions(slotID: CK_SLOT_ID) {
        provider()?.close_all_sessions(slotID)
    }
);

cryptoki_fn!(
    unsafe fn C_GetSessionInfo(hSession: CK_SESSION_HANDLE, pInfo: CK_SESSION_INFO_PTR) {
        let provider = provider()?;
        not_null!(pInfo);
        let session = provider.session_info(hSession)?;
        let info = CK_SESSION_INFO {
            slotID: session.slot,
            state: session.state,
            flags: session.flags,
            ulDeviceError: 0,
        };
        unsafe { *pInfo = info };
        Ok(())
    }
);

cryptoki_fn_not_supported!(
    C_GetOperationState,
    hSession: CK_SESSION_HANDLE,
    pOperationState: CK_BYTE_PTR,
    pulOperationStateLen: CK_ULONG_PTR
);

cryptoki_fn_not_supported!(
    C_SetOperationState,
    hSession: CK_SESSION_HANDLE,
    pOperationState: CK_BYTE_PTR,
    ulOperationStateLen: CK_ULONG,
    hEncryptionKey: CK_OBJECT_HANDLE,
    hAuthenticationKey: CK_OBJECT_HANDLE
);

cryptoki_fn!(
    unsafe fn C_Login(hSession: CK_SESSION_HANDLE, userType: CK_USER_TYPE, pPin: CK_UTF8CHAR_PTR, ulPinLen: CK_ULONG) {
        let provider = provider()?;
        let pin = unsafe { util::input(pPin, ulPinLen)? };
        provider.login(hSession, userType, pin)
    }
);

cryptoki_fn!(
    fn C_Logout(hSession: CK_SESSION_HANDLE) {
        provider()?.logout(hSession)
    }
);

cryptoki_fn!(
    unsafe fn C_InitPIN(hSession: CK_SESSION_HANDLE, pPin: CK_UTF8CHAR_PTR, ulPinLen: CK_ULONG) {
        let provider = provider()?;
        let pin = unsafe { util::input(pPin, ulPinLen)? };
        provider.init_pin(hSession, pin)
    }
);

cryptoki_fn!(
    unsafe fn C_SetPIN(
        hSession: CK_SESSION_HANDLE,
        pOldPin: CK_UTF8CHAR_PTR,
        ulOldLen: CK_ULONG,
        pNewPin: CK_UTF8CHAR_PTR,
        ulNewLen: CK_ULONG,
    ) {
        let provider = provider()?;
        let old = unsafe { util::input(pOldPin, ulOldLen)? };
        let new = unsafe { util::input(pNewPin, ulNewLen)? };
        provider.set_pin(hSession, old, new)
    }
);

// objects

cryptoki_fn_not_supported!(
    C_CreateObject,
    hSession: CK_SESSION_HANDLE,
    pTemplate: CK_ATTRIBUTE_PTR,
    ulCount: CK_ULONG,
    phObject: CK_OBJECT_HANDLE_PTR
);

cryptoki_fn_not_supported!(
    C_CopyObject,
    hSession: CK_SESSION_HANDLE,
    hObject: CK_OBJECT_HANDLE,
    pTemplate: CK_ATTRIBUTE_PTR,
    ulCount: CK_ULONG,
    phNewObject: CK_OBJECT_HANDLE_PTR
);

cryptoki_fn_not_supported!(C_DestroyObject, hSession: CK_SESSION_HANDLE, hObject: CK_OBJECT_HANDLE);

cryptoki_fn_not_supported!(
    C_GetObjectSize,
    hSession: CK_SESSION_HANDLE,
    hObject: CK_OBJECT_HANDLE,
    pulSize: CK_ULONG_PTR
);

cryptoki_fn!(
    unsafe fn C_GetAttributeValue(
        hSession: CK_SESSION_HANDLE,
        hObject: CK_OBJECT_HANDLE,
        pTemplate: CK_ATTRIBUTE_PTR,
        ulCount: CK_ULONG,
    ) {
        let provider = provider()?;
        let template = unsafe { util::template(pTemplate, ulCount)? };
        let kinds: Vec<CK_ATTRIBUTE_TYPE> = template.iter().map(|entry| entry.type_).collect();
        let values = provider.attribute_values(hSession, hObject, &kinds)?;
        unsafe { util::fill_attributes(template, &values) }
    }
);

cryptoki_fn_not_supported!(
    C_SetAttributeValue,
    hSession: CK_SESSION_HANDLE,
    hObject: CK_OBJECT_HANDLE,
    pTemplate: CK_ATTRIBUTE_PTR,
    ulCount: CK_ULONG
);

cryptoki_fn!(
    unsafe fn C_FindObjectsInit(hSession: CK_SESSION_HANDLE, pTemplate: CK_ATTRIBUTE_PTR, ulCount: CK_ULONG) {
        let provider = provider()?;
        let template = unsafe { util::read_template(pTemplate, ulCount)? };
        provider.find_init(hSession, &template)
    }
);

cryptoki_fn!(
    unsafe fn C_FindObjects(
        hSession: CK_SESSION_HANDLE,
        phObject: CK_OBJECT_HANDLE_PTR,
        ulMaxObjectCount: CK_ULONG,
        pulObjectCount: CK_ULONG_PTR,
    ) {
        let provider = provider()?;
        not_null!(phObject);
        not_null!(pulObjectCount);
        let found = provider.find_next(hSession, usize::try_from(ulMaxObjectCount)?)?;
        unsafe {
            std::slice::from_raw_parts_mut(phObject, found.len()).copy_from_slice(&found);
            *pulObjectCount = CK_ULONG::try_from(found.len())?;
        }
        Ok(())
    }
);

cryptoki_fn!(
    fn C_FindObjectsFinal(hSession: CK_SESSION_HANDLE) {
        provider()?.find_final(hSession)
    }
);

// encryption

cryptoki_fn!(
    unsafe fn C_EncryptInit(hSession: CK_SESSION_HANDLE, pMechanism: CK_MECHANISM_PTR, hKey: CK_OBJECT_HANDLE) {
        let provider = provider()?;
        let mechanism = unsafe { util::mechanism(pMechanism)? };
        provider.operation_init(hSession, Operation::Encrypt, mechanism, hKey)
    }
);

cryptoki_fn!(
    unsafe fn C_Encrypt(
        hSession: CK_SESSION_HANDLE,
        pData: CK_BYTE_PTR,
        ulDataLen: CK_ULONG,
        pEncryptedData: CK_BYTE_PTR,
        pulEncryptedDataLen: CK_ULONG_PTR,
    ) {
        let provider = provider()?;
        let data = unsafe { util::input(pData, ulDataLen)? };
        let required = provider.encrypt_len(hSession, data)?;
        if unsafe { util::reserve(pEncryptedData, pulEncryptedDataLen, required)? } {
            let encrypted = provider.encrypt(hSession, data)?;
            unsafe { util::write_output(pEncryptedData, pulEncryptedDataLen, &encrypted)? };
        }
        Ok(())
    }
);

cryptoki_fn_not_supported!(
    C_EncryptUpdate,
    hSession: CK_SESSION_HANDLE,
    pPart: CK_BYTE_PTR,
    ulPartLen: CK_ULONG,
    pEncryptedPart: CK_BYTE_PTR,
    pulEncryptedPartLen: CK_ULONG_PTR
);

cryptoki_fn_not_supported!(
    C_EncryptFinal,
    hSession: CK_SESSION_HANDLE,
    pLastEncryptedPart: CK_BYTE_PTR,
    pulLastEncryptedPartLen: CK_ULONG_PTR
);

// decryption

cryptoki_fn!(
    unsafe fn C_DecryptInit(hSession: CK_SESSION_HANDLE, pMechanism: CK_MECHANISM_PTR, hKey: CK_OBJECT_HANDLE) {
        let provider = provider()?;
        let mechanism = unsafe { util::mechanism(pMechanism)? };
        provider.operation_init(hSession, Operation::Decrypt, mechanism, hKey)
    }
);

cryptoki_fn!(
    unsafe fn C_Decrypt(
        hSession: CK_SESSION_HANDLE,
        pEncryptedData: CK_BYTE_PTR,
        ulEncryptedDataLen: CK_ULONG,
        pData: CK_BYTE_PTR,
        pulDataLen: CK_ULONG_PTR,
    ) {
        let provider = provider()?;
        let encrypted = unsafe { util::input(pEncryptedData, ulEncryptedDataLen)? };
        let required = provider.decrypt_len(hSession, encrypted)?;
        if unsafe { util::reserve(pData, pulDataLen, required)? } {
            let plaintext = provider.decrypt(hSession, encrypted)?;
            unsafe { util::write_output(pData, pulDataLen, &plaintext)? };
        }
        Ok(())
    }
);

cryptoki_fn_not_supported!(
    C_DecryptUpdate,
    hSession: CK_SESSION_HANDLE,
    pEncryptedPart: CK_BYTE_PTR,
    ulEncryptedPartLen: CK_ULONG,
    pPart: CK_BYTE_PTR,
    pulPartLen: CK_ULONG_PTR
);

cryptoki_fn_not_supported!(
    C_DecryptFinal,
    hSession: CK_SESSION_HANDLE,
    pLastPart: CK_BYTE_PTR,
    pulLastPartLen: CK_ULONG_PTR
);

// message digesting

cryptoki_fn_not_supported!(C_DigestInit, hSession: CK_SESSION_HANDLE, pMechanism: CK_MECHANISM_PTR);

cryptoki_fn_not_supported!(
    C_Digest,
    hSession: CK_SESSION_HANDLE,
    pData: CK_BYTE_PTR,
    ulDataLen: CK_ULONG,
    pDigest: CK_BYTE_PTR,
    pulDigestLen: CK_ULONG_PTR
);

cryptoki_fn_not_supported!(C_DigestUpdate, hSession: CK_SESSION_HANDLE, pPart: CK_BYTE_PTR, ulPartLen: CK_ULONG);

cryptoki_fn_not_supported!(C_DigestKey, hSession: CK_SESSION_HANDLE, hKey: CK_OBJECT_HANDLE);

cryptoki_fn_not_supported!(
    C_DigestFinal,
    hSession: CK_SESSION_HANDLE,
    pDigest: CK_BYTE_PTR,
    pulDigestLen: CK_ULONG_PTR
);

// signing

cryptoki_fn!(
    unsafe fn C_SignInit(hSession: CK_SESSION_HANDLE, pMechanism: CK_MECHANISM_PTR, hKey: CK_OBJECT_HANDLE) {
        let provider = provider()?;
        let mechanism = unsafe { util::mechanism(pMechanism)? };
        provider.operation_init(hSession, Operation::Sign, mechanism, hKey)
    }
);

cryptoki_fn!(
    unsafe fn C_Sign(
        hSession: CK_SESSION_HANDLE,
        pData: CK_BYTE_PTR,
        ulDataLen: CK_ULONG,
        pSignature: CK_BYTE_PTR,
        pulSignatureLen: CK_ULONG_PTR,
    ) {
        let provider = provider()?;
        let data = unsafe { util::input(pData, ulDataLen)? };
        let required = provider.sign_len(hSession)?;
        if unsafe { util::reserve(pSignature, pulSignatureLen, required)? } {
            let signature = provider.sign(hSession, data)?;
            unsafe { util::write_output(pSignature, pulSignatureLen, &signature)? };
        }
        Ok(())
    }
);

cryptoki_fn!(
    unsafe fn C_SignUpdate(hSession: CK_SESSION_HANDLE, pPart: CK_BYTE_PTR, ulPartLen: CK_ULONG) {
        let provider = provider()?;
        let part = unsafe { util::input(pPart, ulPartLen)? };
        provider.sign_update(hSession, part)
    }
);

cryptoki_fn!(
    unsafe fn C_SignFinal(hSession: CK_SESSION_HANDLE, pSignature: CK_BYTE_PTR, pulSignatureLen: CK_ULONG_PTR) {
        let provider = provider()?;
        let required = provider.sign_len(hSession)?;
        if unsafe { util::reserve(pSignature, pulSignatureLen, required)? } {
            let signature = provider.sign_final(hSession)?;
            unsafe { util::write_output(pSignature, pulSignatureLen, &signature)? };
        }
        Ok(())
    }
);

cryptoki_fn_not_supported!(
    C_SignRecoverInit,
    hSession: CK_SESSION_HANDLE,
    pMechanism: CK_MECHANISM_PTR,
    hKey: CK_OBJECT_HANDLE
);

cryptoki_fn_not_supported!(
    C_SignRecover,
    hSession: CK_SESSION_HANDLE,
    pData: CK_BYTE_PTR,
    ulDataLen: CK_ULONG,
    pSignature: CK_BYTE_PTR,
    pulSignatureLen: CK_ULONG_PTR
);

// verification

cryptoki_fn!(
    unsafe fn C_VerifyInit(hSession: CK_SESSION_HANDLE, pMechanism: CK_MECHANISM_PTR, hKey: CK_OBJECT_HANDLE) {
        let provider = provider()?;
        let mechanism = unsafe { util::mechanism(pMechanism)? };
        provider.operation_init(hSession, Operation::Verify, mechanism, hKey)
    }
);

cryptoki_fn!(
    unsafe fn C_Verify(
        hSession: CK_SESSION_HANDLE,
        pData: CK_BYTE_PTR,
        ulDataLen: CK_ULONG,
        pSignature: CK_BYTE_PTR,
        ulSignatureLen: CK_ULONG,
    ) {
        let provider = provider()?;
        let data = unsafe { util::input(pData, ulDataLen)? };
        let signature = unsafe { util::input(pSignature, ulSignatureLen)? };
        provider.verify(hSession, data, signature)
    }
);

cryptoki_fn!(
    unsafe fn C_VerifyUpdate(hSession: CK_SESSION_HANDLE, pPart: CK_BYTE_PTR, ulPartLen: CK_ULONG) {
        let provider = provider()?;
        let part = unsafe { util::input(pPart, ulPartLen)? };
        provider.verify_update(hSession, part)
    }
);

cryptoki_fn!(
    unsafe fn C_VerifyFinal(hSession: CK_SESSION_HANDLE, pSignature: CK_BYTE_PTR, ulSignatureLen: CK_ULONG) {
        let provider = provider()?;
        let signature = unsafe { util::input(pSignature, ulSignatureLen)? };
        provider.verify_final(hSession, signature)
    }
);

cryptoki_fn_not_supported!(
    C_VerifyRecoverInit,
    hSession: CK_SESSION_HANDLE,
    pMechanism: CK_MECHANISM_PTR,
    hKey: CK_OBJECT_HANDLE
);

cryptoki_fn_not_supported!(
    C_VerifyRecover,
    hSession: CK_SESSION_HANDLE,
    pSignature: CK_BYTE_PTR,
    ulSignatureLen: CK_ULONG,
    pData: CK_BYTE_PTR,
    pulDataLen: CK_ULONG_PTR
);

// dual-function operations

cryptoki_fn_not_supported!(
    C_DigestEncryptUpdate,
    hSession: CK_SESSION_HANDLE,
    pPart: CK_BYTE_PTR,
    ulPartLen: CK_ULONG,
    pEncryptedPart: CK_BYTE_PTR,
    pulEncryptedPartLen: CK_ULONG_PTR
);

cryptoki_fn_not_supported!(
    C_DecryptDigestUpdate,
    hSession: CK_SESSION_HANDLE,
    pEncryptedPart: CK_BYTE_PTR,
    ulEncryptedPartLen: CK_ULONG,
    pPart: CK_BYTE_PTR,
    pulPartLen: CK_ULONG_PTR
);

cryptoki_fn_not_supported!(
    C_SignEncryptUpdate,
    hSession: CK_SESSION_HANDLE,
    pPart: CK_BYTE_PTR,
    ulPartLen: CK_ULONG,
    pEncryptedPart: CK_BYTE_PTR,
    pulEncryptedPartLen: CK_ULONG_PTR
);

cryptoki_fn_not_supported!(
    C_DecryptVerifyUpdate,
    hSession: CK_SESSION_HANDLE,
    pEncryptedPart: CK_BYTE_PTR,
    ulEncryptedPartLen: CK_ULONG,
    pPart: CK_BYTE_PTR,
    pulPartLen: CK_ULONG_PTR
);

// key management

cryptoki_fn_not_supported!(
    C_GenerateKey,
    hSession: CK_SESSION_HANDLE,
    pMechanism: CK_MECHANISM_PTR,
    pTemplate: CK_ATTRIBUTE_PTR,
    ulCount: CK_ULONG,
    phKey: CK_OBJECT_HANDLE_PTR
);

cryptoki_fn_not_supported!(
    C_GenerateKeyPair,
    hSession: CK_SESSION_HANDLE,
    pMechanism: CK_MECHANISM_PTR,
    pPublicKeyTemplate: CK_ATTRIBUTE_PTR,
    ulPublicKeyAttributeCount: CK_ULONG,
    pPrivateKeyTemplate: CK_ATTRIBUTE_PTR,
    ulPrivateKeyAttributeCount: CK_ULONG,
    phPublicKey: CK_OBJECT_HANDLE_PTR,
    phPrivateKey: CK_OBJECT_HANDLE_PTR
);

cryptoki_fn_not_supported!(
    C_WrapKey,
    hSession: CK_SESSION_HANDLE,
    pMechanism: CK_MECHANISM_PTR,
    hWrappingKey: CK_OBJECT_HANDLE,
    hKey: CK_OBJECT_HANDLE,
    pWrappedKey: CK_BYTE_PTR,
    pulWrappedKeyLen: CK_ULONG_PTR
);

cryptoki_fn_not_supported!(
    C_UnwrapKey,
    hSession: CK_SESSION_HANDLE,
    pMechanism: CK_MECHANISM_PTR,
    hUnwrappingKey: CK_OBJECT_HANDLE,
    pWrappedKey: CK_BYTE_PTR,
    ulWrappedKeyLen: CK_ULONG,
    pTemplate: CK_ATTRIBUTE_PTR,
    ulAttributeCount: CK_ULONG,
    phKey: CK_OBJECT_HANDLE_PTR
);

cryptoki_fn_not_supported!(
    C_DeriveKey,
    hSession: CK_SESSION_HANDLE,
    pMechanism: CK_MECHANISM_PTR,
    hBaseKey: CK_OBJECT_HANDLE,
    pTemplate: CK_ATTRIBUTE_PTR,
    ulAttributeCount: CK_ULONG,
    phKey: CK_OBJECT_HANDLE_PTR
);

// random numbers

cryptoki_fn_not_supported!(C_SeedRandom, hSession: CK_SESSION_HANDLE, pSeed: CK_BYTE_PTR, ulSeedLen: CK_ULONG);

cryptoki_fn!(
    unsafe fn C_GenerateRandom(hSession: CK_SESSION_HANDLE, RandomData: CK_BYTE_PTR, ulRandomLen: CK_ULONG) {
        let provider = provider()?;
        let len = usize::try_from(ulRandomLen)?;
        if len == 0 {
            return Ok(());
        }
        not_null!(RandomData);
        let random = provider.generate_random(hSession, len)?;
        unsafe { std::slice::from_raw_parts_mut(RandomData, len) }.copy_from_slice(&random);
        Ok(())
    }
);

// legacy parallel functions

cryptoki_fn_not_supported!(C_GetFunctionStatus, hSession: CK_SESSION_HANDLE);

cryptoki_fn_not_supported!(C_CancelFunction, hSession: CK_SESSION_HANDLE);

#[cfg(test)]
mod tests {
    use super::*;

    fn init_args() -> CK_C_INITIALIZE_ARGS {
        CK_C_INITIALIZE_ARGS {
            CreateMutex: None,
            DestroyMutex: None,
            LockMutex: None,
            UnlockMutex: None,
            flags: 0,
            pReserved: ptr::null_mut(),
        }
    }

    extern "C" fn create_mutex(_: CK_VOID_PTR_PTR) -> CK_RV {
        CKR_OK
    }

    extern "C" fn mutex_op(_: CK_VOID_PTR) -> CK_RV {
        CKR_OK
    }

    fn with_callbacks() -> CK_C_INITIALIZE_ARGS {
        CK_C_INITIALIZE_ARGS {
            CreateMutex: Some(create_mutex),
            DestroyMutex: Some(mutex_op),
            LockMutex: Some(mutex_op),
            UnlockMutex: Some(mutex_op),
            ..init_args()
        }
    }

    #[test]
    fn test_init_args() {
        check_init_args(&init_args()).unwrap();
        check_init_args(&CK_C_INITIALIZE_ARGS {
            flags: CKF_OS_LOCKING_OK,
            ..init_args()
        })
        .unwrap();

        let mut reserved = 0u8;
        let args = CK_C_INITIALIZE_ARGS {
            pReserved: ptr::addr_of_mut!(reserved).cast(),
            ..init_args()
        };
        assert_eq!(check_init_args(&args).unwrap_err().rv(), CKR_ARGUMENTS_BAD);
    }

    #[test]
    fn test_mutex_callbacks() {
        assert_eq!(check_init_args(&with_callbacks()).unwrap_err().rv(), CKR_CANT_LOCK);
        check_init_args(&CK_C_INITIALIZE_ARGS {
            flags: CKF_OS_LOCKING_OK,
            ..with_callbacks()
        })
        .unwrap();
        let partial = CK_C_INITIALIZE_ARGS {
            LockMutex: None,
            ..with_callbacks()
        };
        assert_eq!(check_init_args(&partial).unwrap_err().rv(), CKR_ARGUMENTS_BAD);
    }

    #[test]
    fn test_panics_become_general_error() {
        let rv = result_to_rv("C_Test", || panic!("card on fire"));
        assert_eq!(rv, CKR_GENERAL_ERROR);
        // the entry frame was popped by the unwind
        assert!(trail::snapshot().is_empty());
    }

    #[test]
    fn test_errors_become_rv() {
        assert_eq!(result_to_rv("C_Test", || Ok(())), CKR_OK);
        assert_eq!(
            result_to_rv("C_Test", || Err(ErrorKind::PinLocked.into())),
            CKR_PIN_LOCKED
        );
    }

    #[test]
    fn test_function_list() {
        let mut list: CK_FUNCTION_LIST_PTR = ptr::null_mut();
        assert_eq!(unsafe { C_GetFunctionList(&mut list) }, CKR_OK);
        let list = unsafe { &*list };
        assert_eq!((list.version.major, list.version.minor), (2, 40));
        assert!(list.C_WaitForSlotEvent.is_some());
        assert_eq!(unsafe { C_GetFunctionList(ptr::null_mut()) }, CKR_ARGUMENTS_BAD);
        assert_eq!(C_DigestInit(0, ptr::null_mut()), CKR_FUNCTION_NOT_SUPPORTED);
    }
}

//! Cryptoki entry points driven through the function list, as a host would
#![cfg(feature = "virtual-card")]

use std::mem;
use std::ptr;
use std::sync::Once;
use std::thread;
use std::time::Duration;

use cie_pkcs11::abi::C_GetFunctionList;
use cie_pkcs11::backend::virtual_card::{DEFAULT_PIN, DEFAULT_SERIAL};
use parking_lot::{Mutex, MutexGuard};
use pkcs11_sys::*;

/// The provider is process global, tests take turns
static SERIAL: Mutex<()> = Mutex::new(());
static ENV: Once = Once::new();

fn exclusive() -> MutexGuard<'static, ()> {
    ENV.call_once(|| unsafe {
        std::env::set_var("CIE_PKCS11_BACKEND", "virtual");
        std::env::set_var("CIE_PKCS11_SLOT_POLL_INTERVAL_MS", "20");
        std::env::set_var("CIE_PKCS11_CONFIG", "/nonexistent/cie-pkcs11.toml");
    });
    SERIAL.lock()
}

fn functions() -> &'static CK_FUNCTION_LIST {
    let mut list: CK_FUNCTION_LIST_PTR = ptr::null_mut();
    assert_eq!(unsafe { C_GetFunctionList(&mut list) }, CKR_OK);
    unsafe { &*list }
}

macro_rules! ck {
    ($name:ident($($arg:expr),* $(,)?)) => {
        unsafe { (functions().$name.unwrap())($($arg),*) }
    };
}

fn ulong(len: usize) -> CK_ULONG {
    CK_ULONG::try_from(len).unwrap()
}

fn mechanism(kind: CK_MECHANISM_TYPE) -> CK_MECHANISM {
    CK_MECHANISM {
        mechanism: kind,
        pParameter: ptr::null_mut(),
        ulParameterLen: 0,
    }
}

fn attribute<T>(kind: CK_ATTRIBUTE_TYPE, value: &mut T) -> CK_ATTRIBUTE {
    CK_ATTRIBUTE {
        type_: kind,
        pValue: ptr::from_mut(value).cast(),
        ulValueLen: ulong(mem::size_of::<T>()),
    }
}

fn find_one(session: CK_SESSION_HANDLE, mut class: CK_OBJECT_CLASS) -> CK_OBJECT_HANDLE {
    let mut template = [attribute(CKA_CLASS, &mut class)];
    assert_eq!(ck!(C_FindObjectsInit(session, template.as_mut_ptr(), 1)), CKR_OK);
    let mut handles = [0; 4];
    let mut found = 0;
    assert_eq!(ck!(C_FindObjects(session, handles.as_mut_ptr(), 4, &mut found)), CKR_OK);
    assert_eq!(ck!(C_FindObjectsFinal(session)), CKR_OK);
    assert_eq!(found, 1);
    handles[0]
}

fn first_slot() -> CK_SLOT_ID {
    let mut count = 0;
    assert_eq!(ck!(C_GetSlotList(CK_TRUE, ptr::null_mut(), &mut count)), CKR_OK);
    assert_eq!(count, 1);
    let mut slots = vec![CK_SLOT_ID::MAX; 1];
    assert_eq!(ck!(C_GetSlotList(CK_TRUE, slots.as_mut_ptr(), &mut count)), CKR_OK);
    slots[0]
}

#[test]
fn test_full_session() {
    let _guard = exclusive();
    assert_eq!(ck!(C_Initialize(ptr::null_mut())), CKR_OK);

    let mut info: CK_INFO = unsafe { mem::zeroed() };
    assert_eq!(ck!(C_GetInfo(&mut info)), CKR_OK);
    assert_eq!((info.cryptokiVersion.major, info.cryptokiVersion.minor), (2, 40));
    assert!(info.manufacturerID.starts_with(b"CIE Middleware "));

    // slot list, including a buffer that is too small
    let mut count = 0;
    assert_eq!(ck!(C_GetSlotList(CK_FALSE, ptr::null_mut(), &mut count)), CKR_OK);
    assert_eq!(count, 1);
    let mut none: [CK_SLOT_ID; 0] = [];
    let mut zero = 0;
    assert_eq!(
        ck!(C_GetSlotList(CK_FALSE, none.as_mut_ptr(), &mut zero)),
        CKR_BUFFER_TOO_SMALL
    );
    assert_eq!(zero, 1);
    let slot = first_slot();

    let mut slot_info: CK_SLOT_INFO = unsafe { mem::zeroed() };
    assert_eq!(ck!(C_GetSlotInfo(slot, &mut slot_info)), CKR_OK);
    assert_ne!(slot_info.flags & CKF_TOKEN_PRESENT, 0);

    let mut token: CK_TOKEN_INFO = unsafe { mem::zeroed() };
    assert_eq!(ck!(C_GetTokenInfo(slot, &mut token)), CKR_OK);
    let label = format!("CIE ({DEFAULT_SERIAL})");
    assert!(token.label.starts_with(label.as_bytes()));
    assert!(token.label[label.len()..].iter().all(|byte| *byte == b' '));
    assert_eq!((token.ulMinPinLen, token.ulMaxPinLen), (8, 8));
    assert_ne!(token.flags & CKF_LOGIN_REQUIRED, 0);

    let mut mechanisms = [0; 8];
    let mut count = 8;
    assert_eq!(
        ck!(C_GetMechanismList(slot, mechanisms.as_mut_ptr(), &mut count)),
        CKR_OK
    );
    assert_eq!(count, 5);
    assert!(mechanisms[..5].contains(&CKM_SHA256_RSA_PKCS));

    let mut session = 0;
    assert_eq!(
        ck!(C_OpenSession(slot, CKF_SERIAL_SESSION, ptr::null_mut(), None, &mut session)),
        CKR_OK
    );
    assert_eq!(
        ck!(C_Login(session, CKU_USER, DEFAULT_PIN.as_ptr().cast_mut(), 8)),
        CKR_OK
    );
    let mut session_info: CK_SESSION_INFO = unsafe { mem::zeroed() };
    assert_eq!(ck!(C_GetSessionInfo(session, &mut session_info)), CKR_OK);
    assert_eq!(session_info.state, CKS_RO_USER_FUNCTIONS);

    let private = find_one(session, CKO_PRIVATE_KEY);
    let public = find_one(session, CKO_PUBLIC_KEY);

    // attributes, length first
    let mut template = [
        CK_ATTRIBUTE {
            type_: CKA_LABEL,
            pValue: ptr::null_mut(),
            ulValueLen: 0,
        },
        CK_ATTRIBUTE {
            type_: CKA_MODULUS,
            pValue: ptr::null_mut(),
            ulValueLen: 0,
        },
    ];
    assert_eq!(
        ck!(C_GetAttributeValue(session, public, template.as_mut_ptr(), 2)),
        CKR_OK
    );
    assert_eq!((template[0].ulValueLen, template[1].ulValueLen), (4, 256));
    let mut label = vec![0u8; 4];
    let mut modulus = vec![0u8; 256];
    template[0].pValue = label.as_mut_ptr().cast();
    template[1].pValue = modulus.as_mut_ptr().cast();
    assert_eq!(
        ck!(C_GetAttributeValue(session, public, template.as_mut_ptr(), 2)),
        CKR_OK
    );
    assert_eq!(label, b"CIE0");
    assert_ne!(modulus[0], 0);

    let mut exponent = [CK_ATTRIBUTE {
        type_: CKA_PRIVATE_EXPONENT,
        pValue: ptr::null_mut(),
        ulValueLen: 0,
    }];
    assert_eq!(
        ck!(C_GetAttributeValue(session, private, exponent.as_mut_ptr(), 1)),
        CKR_ATTRIBUTE_SENSITIVE
    );
    assert_eq!(exponent[0].ulValueLen, CK_UNAVAILABLE_INFORMATION);

    // sign, probing the length and surviving a short buffer
    let data = b"some text to sign";
    let mut sha256 = mechanism(CKM_SHA256_RSA_PKCS);
    assert_eq!(ck!(C_SignInit(session, &mut sha256, private)), CKR_OK);
    let mut len = 0;
    assert_eq!(
        ck!(C_Sign(session, data.as_ptr().cast_mut(), ulong(data.len()), ptr::null_mut(), &mut len)),
        CKR_OK
    );
    assert_eq!(len, 256);
    let mut signature = vec![0u8; 256];
    let mut short = 10;
    assert_eq!(
        ck!(C_Sign(session, data.as_ptr().cast_mut(), ulong(data.len()), signature.as_mut_ptr(), &mut short)),
        CKR_BUFFER_TOO_SMALL
    );
    assert_eq!(short, 256);
    assert_eq!(
        ck!(C_Sign(session, data.as_ptr().cast_mut(), ulong(data.len()), signature.as_mut_ptr(), &mut len)),
        CKR_OK
    );
    assert_eq!(
        ck!(C_Sign(session, data.as_ptr().cast_mut(), ulong(data.len()), signature.as_mut_ptr(), &mut len)),
        CKR_OPERATION_NOT_INITIALIZED
    );

    assert_eq!(ck!(C_VerifyInit(session, &mut sha256, public)), CKR_OK);
    assert_eq!(
        ck!(C_Verify(session, data.as_ptr().cast_mut(), ulong(data.len()), signature.as_mut_ptr(), 256)),
        CKR_OK
    );
    signature[0] ^= 0xff;
    assert_eq!(ck!(C_VerifyInit(session, &mut sha256, public)), CKR_OK);
    assert_eq!(
        ck!(C_Verify(session, data.as_ptr().cast_mut(), ulong(data.len()), signature.as_mut_ptr(), 256)),
        CKR_SIGNATURE_INVALID
    );

    // encrypt on the host, decrypt on the card
    let plaintext = b"the quick brown fox";
    let mut raw = mechanism(CKM_RSA_PKCS);
    assert_eq!(ck!(C_EncryptInit(session, &mut raw, public)), CKR_OK);
    let mut len = 0;
    assert_eq!(
        ck!(C_Encrypt(session, plaintext.as_ptr().cast_mut(), ulong(plaintext.len()), ptr::null_mut(), &mut len)),
        CKR_OK
    );
    let mut ciphertext = vec![0u8; usize::try_from(len).unwrap()];
    assert_eq!(
        ck!(C_Encrypt(session, plaintext.as_ptr().cast_mut(), ulong(plaintext.len()), ciphertext.as_mut_ptr(), &mut len)),
        CKR_OK
    );
    assert_eq!(len, 256);

    assert_eq!(ck!(C_DecryptInit(session, &mut raw, private)), CKR_OK);
    let mut len = 0;
    assert_eq!(
        ck!(C_Decrypt(session, ciphertext.as_mut_ptr(), 256, ptr::null_mut(), &mut len)),
        CKR_OK
    );
    assert_eq!(len, ulong(plaintext.len()));
    let mut decrypted = vec![0u8; plaintext.len()];
    assert_eq!(
        ck!(C_Decrypt(session, ciphertext.as_mut_ptr(), 256, decrypted.as_mut_ptr(), &mut len)),
        CKR_OK
    );
    assert_eq!(decrypted, plaintext);

    let mut random = [0u8; 16];
    assert_eq!(ck!(C_GenerateRandom(session, random.as_mut_ptr(), 16)), CKR_OK);

    assert_eq!(ck!(C_Logout(session)), CKR_OK);
    assert_eq!(ck!(C_Logout(session)), CKR_USER_NOT_LOGGED_IN);
    assert_eq!(ck!(C_CloseSession(session)), CKR_OK);
    assert_eq!(ck!(C_CloseSession(session)), CKR_SESSION_HANDLE_INVALID);
    assert_eq!(ck!(C_Finalize(ptr::null_mut())), CKR_OK);
}

#[test]
fn test_lifecycle() {
    let _guard = exclusive();
    let mut info: CK_INFO = unsafe { mem::zeroed() };
    assert_eq!(ck!(C_GetInfo(&mut info)), CKR_CRYPTOKI_NOT_INITIALIZED);
    assert_eq!(ck!(C_Finalize(ptr::null_mut())), CKR_CRYPTOKI_NOT_INITIALIZED);

    let mut args = CK_C_INITIALIZE_ARGS {
        CreateMutex: None,
        DestroyMutex: None,
        LockMutex: None,
        UnlockMutex: None,
        flags: CKF_OS_LOCKING_OK,
        pReserved: ptr::null_mut(),
    };
    assert_eq!(ck!(C_Initialize(ptr::from_mut(&mut args).cast())), CKR_OK);
    assert_eq!(ck!(C_Initialize(ptr::null_mut())), CKR_CRYPTOKI_ALREADY_INITIALIZED);
    assert_eq!(ck!(C_GetInfo(ptr::null_mut())), CKR_ARGUMENTS_BAD);

    let mut session = 0;
    assert_eq!(
        ck!(C_OpenSession(0, CKF_SERIAL_SESSION, ptr::null_mut(), None, &mut session)),
        CKR_OK
    );
    assert_eq!(
        ck!(C_OpenSession(0, 0, ptr::null_mut(), None, &mut session)),
        CKR_SESSION_PARALLEL_NOT_SUPPORTED
    );
    assert_eq!(
        ck!(C_OpenSession(9, CKF_SERIAL_SESSION, ptr::null_mut(), None, &mut session)),
        CKR_SLOT_ID_INVALID
    );
    assert_eq!(ck!(C_DigestInit(session, ptr::null_mut())), CKR_FUNCTION_NOT_SUPPORTED);

    assert_eq!(ck!(C_Finalize(ptr::null_mut())), CKR_OK);
    assert_eq!(ck!(C_CloseSession(session)), CKR_CRYPTOKI_NOT_INITIALIZED);

    // sessions do not survive a restart
    assert_eq!(ck!(C_Initialize(ptr::null_mut())), CKR_OK);
    let mut session_info: CK_SESSION_INFO = unsafe { mem::zeroed() };
    assert_eq!(
        ck!(C_GetSessionInfo(session, &mut session_info)),
        CKR_SESSION_HANDLE_INVALID
    );
    assert_eq!(ck!(C_Finalize(ptr::null_mut())), CKR_OK);
}

#[test]
fn test_wrong_pin() {
    let _guard = exclusive();
    assert_eq!(ck!(C_Initialize(ptr::null_mut())), CKR_OK);
    let slot = first_slot();
    let mut session = 0;
    assert_eq!(
        ck!(C_OpenSession(slot, CKF_SERIAL_SESSION, ptr::null_mut(), None, &mut session)),
        CKR_OK
    );
    let mut wrong = *b"00000000";
    assert_eq!(ck!(C_Login(session, CKU_USER, wrong.as_mut_ptr(), 8)), CKR_PIN_INCORRECT);
    assert_eq!(ck!(C_Login(session, CKU_USER, wrong.as_mut_ptr(), 4)), CKR_PIN_LEN_RANGE);
    assert_eq!(ck!(C_Login(session, CKU_USER, ptr::null_mut(), 8)), CKR_ARGUMENTS_BAD);

    let mut token: CK_TOKEN_INFO = unsafe { mem::zeroed() };
    assert_eq!(ck!(C_GetTokenInfo(slot, &mut token)), CKR_OK);
    assert_ne!(token.flags & CKF_USER_PIN_COUNT_LOW, 0);

    // a correct login resets the counter
    assert_eq!(
        ck!(C_Login(session, CKU_USER, DEFAULT_PIN.as_ptr().cast_mut(), 8)),
        CKR_OK
    );
    assert_eq!(ck!(C_Finalize(ptr::null_mut())), CKR_OK);
}

#[test]
fn test_slot_events() {
    let _guard = exclusive();
    assert_eq!(ck!(C_Initialize(ptr::null_mut())), CKR_OK);
    let mut slot = CK_SLOT_ID::MAX;
    assert_eq!(
        ck!(C_WaitForSlotEvent(CKF_DONT_BLOCK, &mut slot, ptr::null_mut())),
        CKR_NO_EVENT
    );
    assert_eq!(slot, CK_SLOT_ID::MAX);

    let waiter = thread::spawn(|| {
        let mut slot = 0;
        ck!(C_WaitForSlotEvent(0, &mut slot, ptr::null_mut()))
    });
    thread::sleep(Duration::from_millis(100));
    assert_eq!(ck!(C_Finalize(ptr::null_mut())), CKR_OK);
    assert_eq!(waiter.join().unwrap(), CKR_CRYPTOKI_NOT_INITIALIZED);
}

//! Provider engine tests on the virtual card
#![cfg(feature = "virtual-card")]

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use cie_pkcs11::backend::virtual_card::{DEFAULT_PIN, DEFAULT_PUK, DEFAULT_READER, DEFAULT_SERIAL};
use cie_pkcs11::backend::{VirtualCard, VirtualCardBackend};
use cie_pkcs11::{Attribute, AttributeValue, ErrorKind, Mechanism, Operation, Provider, ProviderConfig};
use pkcs11_sys::*;
use sha2::{Digest, Sha256};

const RW: CK_FLAGS = CKF_SERIAL_SESSION | CKF_RW_SESSION;
const RO: CK_FLAGS = CKF_SERIAL_SESSION;

fn provider() -> (VirtualCardBackend, Provider) {
    let backend = VirtualCardBackend::with_default_card().unwrap();
    let config = ProviderConfig {
        slot_poll_interval_ms: 20,
        ..ProviderConfig::default()
    };
    let provider = Provider::with_backend(config, Arc::new(backend.clone())).unwrap();
    (backend, provider)
}

fn kind<T: std::fmt::Debug>(result: cie_pkcs11::Result<T>) -> ErrorKind {
    result.unwrap_err().kind().clone()
}

fn find(provider: &Provider, session: CK_SESSION_HANDLE, template: &[Attribute]) -> HashSet<CK_OBJECT_HANDLE> {
    provider.find_init(session, template).unwrap();
    let mut found = HashSet::new();
    loop {
        let batch = provider.find_next(session, 2).unwrap();
        if batch.is_empty() {
            break;
        }
        found.extend(batch);
    }
    provider.find_final(session).unwrap();
    found
}

fn object(provider: &Provider, session: CK_SESSION_HANDLE, class: CK_OBJECT_CLASS) -> CK_OBJECT_HANDLE {
    let found = find(provider, session, &[Attribute::ulong(CKA_CLASS, class)]);
    assert_eq!(found.len(), 1);
    found.into_iter().next().unwrap()
}

fn value(provider: &Provider, session: CK_SESSION_HANDLE, object: CK_OBJECT_HANDLE, kind: CK_ATTRIBUTE_TYPE) -> Vec<u8> {
    match provider.attribute_values(session, object, &[kind]).unwrap().remove(0) {
        AttributeValue::Available(value) => value,
        other => panic!("attribute {kind:#x} not available: {other:?}"),
    }
}

fn sign(provider: &Provider, session: CK_SESSION_HANDLE, mechanism: Mechanism, data: &[u8]) -> Vec<u8> {
    let key = object(provider, session, CKO_PRIVATE_KEY);
    provider
        .operation_init(session, Operation::Sign, Some(mechanism.ck()), key)
        .unwrap();
    provider.sign(session, data).unwrap()
}

fn verify(
    provider: &Provider,
    session: CK_SESSION_HANDLE,
    mechanism: Mechanism,
    data: &[u8],
    signature: &[u8],
) -> cie_pkcs11::Result<()> {
    let key = object(provider, session, CKO_PUBLIC_KEY);
    provider
        .operation_init(session, Operation::Verify, Some(mechanism.ck()), key)
        .unwrap();
    provider.verify(session, data, signature)
}

#[test]
fn test_slots_and_token_info() {
    let (_, provider) = provider();
    assert_eq!(provider.slot_list(false), [0]);
    assert_eq!(provider.slot_list(true), [0]);

    let slot = provider.slot_info(0).unwrap();
    assert_eq!(slot.description, DEFAULT_READER);
    assert!(slot.token_present);
    assert_eq!(kind(provider.slot_info(5)), ErrorKind::SlotIdInvalid(5));

    let _ro = provider.open_session(0, RO).unwrap();
    let _rw = provider.open_session(0, RW).unwrap();
    let token = provider.token_info(0).unwrap();
    assert_eq!(token.label, format!("CIE ({DEFAULT_SERIAL})"));
    assert_eq!(token.serial, DEFAULT_SERIAL);
    assert_eq!(token.manufacturer, "IPZS");
    assert_eq!(token.pin_len, (8, 8));
    assert_eq!((token.session_count, token.rw_session_count), (2, 1));
    let expected = CKF_TOKEN_INITIALIZED | CKF_LOGIN_REQUIRED | CKF_USER_PIN_INITIALIZED | CKF_RNG;
    assert_eq!(token.flags & expected, expected);
    assert_eq!(token.flags & CKF_USER_PIN_LOCKED, 0);
}

#[test]
fn test_empty_slot() {
    let (backend, provider) = provider();
    backend.add_reader("Empty Reader");
    provider.update_slot_list().unwrap();
    assert_eq!(provider.slot_list(false), [0, 1]);
    assert_eq!(provider.slot_list(true), [0]);

    assert!(!provider.slot_info(1).unwrap().token_present);
    assert_eq!(kind(provider.token_info(1)), ErrorKind::TokenNotPresent);
    assert_eq!(kind(provider.open_session(1, RO)), ErrorKind::TokenNotPresent);
}

#[test]
fn test_sessions() {
    let (_, provider) = provider();
    assert_eq!(
        kind(provider.open_session(0, CKF_RW_SESSION)),
        ErrorKind::SessionParallelNotSupported
    );

    let first = provider.open_session(0, RO).unwrap();
    let second = provider.open_session(0, RW).unwrap();
    assert_ne!(first, second);

    let info = provider.session_info(first).unwrap();
    assert_eq!((info.slot, info.state, info.flags), (0, CKS_RO_PUBLIC_SESSION, RO));
    assert_eq!(provider.session_info(second).unwrap().state, CKS_RW_PUBLIC_SESSION);

    // object handles belong to their session
    let key = object(&provider, first, CKO_PRIVATE_KEY);
    assert_eq!(
        kind(provider.attribute_values(second, key, &[CKA_LABEL])),
        ErrorKind::ObjectHandleInvalid(key)
    );

    provider.close_session(first).unwrap();
    assert_eq!(kind(provider.session_info(first)), ErrorKind::SessionHandleInvalid(first));
    assert_eq!(
        kind(provider.find_init(first, &[])),
        ErrorKind::SessionHandleInvalid(first)
    );
    assert_eq!(kind(provider.close_session(first)), ErrorKind::SessionHandleInvalid(first));

    provider.close_all_sessions(0).unwrap();
    assert!(provider.session_info(second).is_err());
}

#[test]
fn test_search() {
    let (_, provider) = provider();
    let session = provider.open_session(0, RO).unwrap();

    let all = find(&provider, session, &[]);
    assert_eq!(all.len(), 4);

    let private = find(&provider, session, &[Attribute::bool(CKA_PRIVATE, true)]);
    let key = object(&provider, session, CKO_PRIVATE_KEY);
    assert_eq!(private, HashSet::from([key]));

    // the key pair and the certificate share CKA_ID
    let id = value(&provider, session, key, CKA_ID);
    let pair = find(&provider, session, &[Attribute::bytes(CKA_ID, id)]);
    let expected = HashSet::from([
        key,
        object(&provider, session, CKO_PUBLIC_KEY),
        object(&provider, session, CKO_CERTIFICATE),
    ]);
    assert_eq!(pair, expected);

    let serial = find(
        &provider,
        session,
        &[
            Attribute::ulong(CKA_CLASS, CKO_DATA),
            Attribute::bytes(CKA_LABEL, "SERIAL"),
        ],
    );
    assert_eq!(serial.len(), 1);
    assert!(find(&provider, session, &[Attribute::bytes(CKA_LABEL, "nope")]).is_empty());
}

#[test]
fn test_second_search_is_refused() {
    let (_, provider) = provider();
    let session = provider.open_session(0, RO).unwrap();
    provider.find_init(session, &[]).unwrap();
    let first = provider.find_next(session, 1).unwrap();

    assert_eq!(kind(provider.find_init(session, &[])), ErrorKind::SearchAlreadyActive);

    let rest = provider.find_next(session, 10).unwrap();
    assert_eq!(first.len() + rest.len(), 4);
    provider.find_final(session).unwrap();
    assert_eq!(kind(provider.find_final(session)), ErrorKind::OperationNotInitialized);
}

#[test]
fn test_attributes() {
    let (backend, provider) = provider();
    let session = provider.open_session(0, RO).unwrap();

    let certificate = object(&provider, session, CKO_CERTIFICATE);
    let der = backend
        .with_card(DEFAULT_READER, |card| card.certificate().to_vec())
        .unwrap();
    assert_eq!(value(&provider, session, certificate, CKA_VALUE), der);

    let data = object(&provider, session, CKO_DATA);
    assert_eq!(value(&provider, session, data, CKA_VALUE), DEFAULT_SERIAL.as_bytes());

    let key = object(&provider, session, CKO_PRIVATE_KEY);
    assert_eq!(
        provider
            .attribute_values(session, key, &[CKA_PRIVATE_EXPONENT, CKA_VALUE, CKA_SIGN])
            .unwrap(),
        [
            AttributeValue::Sensitive,
            AttributeValue::Invalid,
            AttributeValue::Available(vec![CK_TRUE]),
        ]
    );
}

#[test]
fn test_sign_and_verify() {
    let (_, provider) = provider();
    let session = provider.open_session(0, RO).unwrap();
    provider.login(session, CKU_USER, DEFAULT_PIN).unwrap();
    assert_eq!(provider.session_info(session).unwrap().state, CKS_RO_USER_FUNCTIONS);

    let data = b"some text to sign";
    for mechanism in Mechanism::ALL.into_iter().filter(|m| m.hasher().is_some()) {
        let key = object(&provider, session, CKO_PRIVATE_KEY);
        provider
            .operation_init(session, Operation::Sign, Some(mechanism.ck()), key)
            .unwrap();
        assert_eq!(provider.sign_len(session).unwrap(), 256);
        let mut signature = provider.sign(session, data).unwrap();
        assert_eq!(signature.len(), 256);

        verify(&provider, session, mechanism, data, &signature).unwrap();
        signature[17] ^= 0x01;
        assert_eq!(
            kind(verify(&provider, session, mechanism, data, &signature)),
            ErrorKind::SignatureInvalid
        );
        assert_eq!(
            kind(verify(&provider, session, mechanism, data, &signature[1..])),
            ErrorKind::SignatureLenRange
        );
    }
}

#[test]
fn test_raw_rsa_signature() {
    let (_, provider) = provider();
    let session = provider.open_session(0, RO).unwrap();
    provider.login(session, CKU_USER, DEFAULT_PIN).unwrap();

    let digest_info = Mechanism::Sha256RsaPkcs.digest_info(&Sha256::digest(b"some text to sign"));
    let raw = sign(&provider, session, Mechanism::RsaPkcs, &digest_info);
    let hashed = sign(&provider, session, Mechanism::Sha256RsaPkcs, b"some text to sign");
    // PKCS#1 v1.5 signatures are deterministic
    assert_eq!(raw, hashed);
    verify(&provider, session, Mechanism::RsaPkcs, &digest_info, &raw).unwrap();

    let key = object(&provider, session, CKO_PRIVATE_KEY);
    provider
        .operation_init(session, Operation::Sign, Some(CKM_RSA_PKCS), key)
        .unwrap();
    assert_eq!(kind(provider.sign(session, &[0; 246])), ErrorKind::DataLenRange);
    // the failure ended the operation
    assert_eq!(kind(provider.sign(session, b"x")), ErrorKind::OperationNotInitialized);
}

#[test]
fn test_multi_part() {
    let (_, provider) = provider();
    let session = provider.open_session(0, RO).unwrap();
    provider.login(session, CKU_USER, DEFAULT_PIN).unwrap();

    let key = object(&provider, session, CKO_PRIVATE_KEY);
    provider
        .operation_init(session, Operation::Sign, Some(CKM_SHA256_RSA_PKCS), key)
        .unwrap();
    provider.sign_update(session, b"some text ").unwrap();
    provider.sign_update(session, b"to sign").unwrap();
    let signature = provider.sign_final(session).unwrap();
    verify(&provider, session, Mechanism::Sha256RsaPkcs, b"some text to sign", &signature).unwrap();

    let public = object(&provider, session, CKO_PUBLIC_KEY);
    provider
        .operation_init(session, Operation::Verify, Some(CKM_SHA256_RSA_PKCS), public)
        .unwrap();
    provider.verify_update(session, b"some text to sign").unwrap();
    provider.verify_final(session, &signature).unwrap();

    provider
        .operation_init(session, Operation::Sign, Some(CKM_RSA_PKCS), key)
        .unwrap();
    assert_eq!(kind(provider.sign_update(session, b"part")), ErrorKind::FunctionNotSupported);
}

#[test]
fn test_operation_init() {
    let (_, provider) = provider();
    let session = provider.open_session(0, RO).unwrap();
    let private = object(&provider, session, CKO_PRIVATE_KEY);
    let public = object(&provider, session, CKO_PUBLIC_KEY);
    let certificate = object(&provider, session, CKO_CERTIFICATE);

    assert_eq!(
        kind(provider.operation_init(session, Operation::Sign, Some(CKM_RSA_PKCS), private)),
        ErrorKind::UserNotLoggedIn
    );
    provider.login(session, CKU_USER, DEFAULT_PIN).unwrap();

    assert_eq!(
        kind(provider.operation_init(session, Operation::Sign, Some(CKM_SHA256_RSA_PKCS), public)),
        ErrorKind::KeyFunctionNotPermitted
    );
    assert_eq!(
        kind(provider.operation_init(session, Operation::Sign, Some(CKM_RSA_PKCS), certificate)),
        ErrorKind::KeyHandleInvalid(certificate)
    );
    assert_eq!(
        kind(provider.operation_init(session, Operation::Encrypt, Some(CKM_SHA256_RSA_PKCS), public)),
        ErrorKind::MechanismInvalid(CKM_SHA256_RSA_PKCS)
    );
    assert_eq!(
        kind(provider.operation_init(session, Operation::Sign, Some(CKM_SHA224_RSA_PKCS), private)),
        ErrorKind::MechanismInvalid(CKM_SHA224_RSA_PKCS)
    );

    provider
        .operation_init(session, Operation::Sign, Some(CKM_RSA_PKCS), private)
        .unwrap();
    assert_eq!(
        kind(provider.operation_init(session, Operation::Sign, Some(CKM_RSA_PKCS), private)),
        ErrorKind::OperationActive
    );
    // a different kind is independent
    provider
        .operation_init(session, Operation::Verify, Some(CKM_RSA_PKCS), public)
        .unwrap();

    provider.operation_init(session, Operation::Sign, None, 0).unwrap();
    assert_eq!(kind(provider.sign_len(session)), ErrorKind::OperationNotInitialized);
    provider
        .operation_init(session, Operation::Sign, Some(CKM_RSA_PKCS), private)
        .unwrap();
}

#[test]
fn test_encrypt_and_decrypt() {
    let (_, provider) = provider();
    let session = provider.open_session(0, RO).unwrap();
    provider.login(session, CKU_USER, DEFAULT_PIN).unwrap();
    let public = object(&provider, session, CKO_PUBLIC_KEY);
    let private = object(&provider, session, CKO_PRIVATE_KEY);

    let plaintext = b"the quick brown fox";
    provider
        .operation_init(session, Operation::Encrypt, Some(CKM_RSA_PKCS), public)
        .unwrap();
    assert_eq!(provider.encrypt_len(session, plaintext).unwrap(), 256);
    let ciphertext = provider.encrypt(session, plaintext).unwrap();
    assert_eq!(ciphertext.len(), 256);

    provider
        .operation_init(session, Operation::Decrypt, Some(CKM_RSA_PKCS), private)
        .unwrap();
    assert_eq!(provider.decrypt_len(session, &ciphertext).unwrap(), plaintext.len());
    assert_eq!(provider.decrypt(session, &ciphertext).unwrap().as_slice(), plaintext);
    assert_eq!(
        kind(provider.decrypt(session, &ciphertext)),
        ErrorKind::OperationNotInitialized
    );

    // without a probe
    provider
        .operation_init(session, Operation::Decrypt, Some(CKM_RSA_PKCS), private)
        .unwrap();
    assert_eq!(provider.decrypt(session, &ciphertext).unwrap().as_slice(), plaintext);

    provider
        .operation_init(session, Operation::Decrypt, Some(CKM_RSA_PKCS), private)
        .unwrap();
    assert_eq!(
        kind(provider.decrypt_len(session, &ciphertext[1..])),
        ErrorKind::EncryptedDataLenRange
    );
    assert_eq!(
        kind(provider.decrypt(session, &ciphertext)),
        ErrorKind::OperationNotInitialized
    );

    provider
        .operation_init(session, Operation::Encrypt, Some(CKM_RSA_PKCS), public)
        .unwrap();
    assert_eq!(kind(provider.encrypt_len(session, &[0; 250])), ErrorKind::DataLenRange);
}

#[test]
fn test_login_errors() {
    let (_, provider) = provider();
    let session = provider.open_session(0, RO).unwrap();
    assert_eq!(kind(provider.logout(session)), ErrorKind::UserNotLoggedIn);
    assert_eq!(kind(provider.login(session, CKU_USER, b"1234")), ErrorKind::PinLenRange);
    assert_eq!(
        kind(provider.login(session, 7, DEFAULT_PIN)),
        ErrorKind::UserTypeInvalid(7)
    );

    provider.login(session, CKU_USER, DEFAULT_PIN).unwrap();
    assert_eq!(
        kind(provider.login(session, CKU_USER, DEFAULT_PIN)),
        ErrorKind::UserAlreadyLoggedIn
    );
    provider.logout(session).unwrap();
    assert_eq!(provider.session_info(session).unwrap().state, CKS_RO_PUBLIC_SESSION);

    // no security officer while a read-only session is open on the slot
    assert_eq!(
        kind(provider.login(session, CKU_SO, DEFAULT_PUK)),
        ErrorKind::SessionReadOnlyExists
    );
    assert_eq!(provider.session_info(session).unwrap().state, CKS_RO_PUBLIC_SESSION);
    let officer = provider.open_session(0, RW).unwrap();
    assert_eq!(
        kind(provider.login(officer, CKU_SO, DEFAULT_PUK)),
        ErrorKind::SessionReadOnlyExists
    );
    assert_eq!(provider.session_info(officer).unwrap().state, CKS_RW_PUBLIC_SESSION);

    provider.close_session(session).unwrap();
    provider.login(officer, CKU_SO, DEFAULT_PUK).unwrap();
    assert_eq!(provider.session_info(officer).unwrap().state, CKS_RW_SO_FUNCTIONS);
}

#[test]
fn test_pin_lock_and_unblock() {
    let (_, provider) = provider();
    let session = provider.open_session(0, RO).unwrap();
    let wrong = b"00000000";

    assert_eq!(
        kind(provider.login(session, CKU_USER, wrong)),
        ErrorKind::PinIncorrect { retries: 2 }
    );
    let flags = provider.token_info(0).unwrap().flags;
    assert_ne!(flags & CKF_USER_PIN_COUNT_LOW, 0);
    assert_eq!(
        kind(provider.login(session, CKU_USER, wrong)),
        ErrorKind::PinIncorrect { retries: 1 }
    );
    assert_ne!(provider.token_info(0).unwrap().flags & CKF_USER_PIN_FINAL_TRY, 0);
    assert_eq!(kind(provider.login(session, CKU_USER, wrong)), ErrorKind::PinLocked);
    assert_eq!(kind(provider.login(session, CKU_USER, DEFAULT_PIN)), ErrorKind::PinLocked);
    assert_ne!(provider.token_info(0).unwrap().flags & CKF_USER_PIN_LOCKED, 0);

    let officer = provider.open_session(0, RW).unwrap();
    assert_eq!(kind(provider.init_pin(officer, DEFAULT_PIN)), ErrorKind::UserNotLoggedIn);
    provider.close_session(session).unwrap();
    provider.login(officer, CKU_SO, DEFAULT_PUK).unwrap();
    assert_eq!(provider.session_info(officer).unwrap().state, CKS_RW_SO_FUNCTIONS);
    provider.init_pin(officer, DEFAULT_PIN).unwrap();

    let session = provider.open_session(0, RO).unwrap();
    provider.login(session, CKU_USER, DEFAULT_PIN).unwrap();
    assert_eq!(provider.token_info(0).unwrap().flags & CKF_USER_PIN_LOCKED, 0);
}

#[test]
fn test_set_pin() {
    let (_, provider) = provider();
    let read_only = provider.open_session(0, RO).unwrap();
    assert_eq!(
        kind(provider.set_pin(read_only, DEFAULT_PIN, b"11112222")),
        ErrorKind::SessionReadOnly
    );

    let session = provider.open_session(0, RW).unwrap();
    assert_eq!(
        kind(provider.set_pin(session, DEFAULT_PIN, b"111")),
        ErrorKind::PinLenRange
    );
    provider.set_pin(session, DEFAULT_PIN, b"11112222").unwrap();

    assert_eq!(
        kind(provider.login(read_only, CKU_USER, DEFAULT_PIN)),
        ErrorKind::PinIncorrect { retries: 2 }
    );
    provider.login(read_only, CKU_USER, b"11112222").unwrap();
}

#[test]
fn test_set_pin_keeps_the_login_usable() {
    let (_, provider) = provider();
    let session = provider.open_session(0, RW).unwrap();
    provider.login(session, CKU_USER, DEFAULT_PIN).unwrap();
    provider.set_pin(session, DEFAULT_PIN, b"11112222").unwrap();
    // signing re-verifies with the new PIN
    sign(&provider, session, Mechanism::Sha1RsaPkcs, b"after the change");
}

#[test]
fn test_generate_random() {
    let (_, provider) = provider();
    let session = provider.open_session(0, RO).unwrap();
    let first = provider.generate_random(session, 20).unwrap();
    let second = provider.generate_random(session, 20).unwrap();
    assert_eq!(first.len(), 20);
    assert_ne!(first, second);
    assert!(provider.generate_random(session, 0).unwrap().is_empty());
}

#[test]
fn test_mechanisms() {
    let (_, provider) = provider();
    let mechanisms: HashSet<_> = provider.mechanism_list(0).unwrap().into_iter().collect();
    assert_eq!(
        mechanisms,
        HashSet::from([
            CKM_RSA_PKCS,
            CKM_SHA1_RSA_PKCS,
            CKM_SHA256_RSA_PKCS,
            CKM_SHA384_RSA_PKCS,
            CKM_SHA512_RSA_PKCS,
        ])
    );

    let raw = provider.mechanism_info(0, CKM_RSA_PKCS).unwrap();
    assert_eq!((raw.min_key_bits, raw.max_key_bits), (1024, 4096));
    assert_ne!(raw.flags & CKF_DECRYPT, 0);
    let hashed = provider.mechanism_info(0, CKM_SHA256_RSA_PKCS).unwrap();
    assert_ne!(hashed.flags & CKF_SIGN, 0);
    assert_eq!(hashed.flags & CKF_ENCRYPT, 0);
    assert_eq!(
        kind(provider.mechanism_info(0, CKM_SHA224_RSA_PKCS)),
        ErrorKind::MechanismInvalid(CKM_SHA224_RSA_PKCS)
    );
}

#[test]
fn test_card_removal_invalidates_sessions() {
    let (backend, provider) = provider();
    let session = provider.open_session(0, RO).unwrap();
    provider.login(session, CKU_USER, DEFAULT_PIN).unwrap();

    backend.remove_card(DEFAULT_READER);
    provider.update_slot_list().unwrap();
    assert_eq!(kind(provider.session_info(session)), ErrorKind::DeviceRemoved);
    assert_eq!(
        kind(provider.session_info(session)),
        ErrorKind::SessionHandleInvalid(session)
    );

    backend.insert_card(DEFAULT_READER, VirtualCard::cie().unwrap());
    let session = provider.open_session(0, RO).unwrap();
    assert_eq!(provider.session_info(session).unwrap().state, CKS_RO_PUBLIC_SESSION);
}

#[test]
fn test_card_swapped_during_session() {
    let (backend, provider) = provider();
    let session = provider.open_session(0, RO).unwrap();
    provider.login(session, CKU_USER, DEFAULT_PIN).unwrap();
    let key = object(&provider, session, CKO_PRIVATE_KEY);
    provider
        .operation_init(session, Operation::Sign, Some(CKM_SHA256_RSA_PKCS), key)
        .unwrap();

    // an identical card, swapped without any refresh in between
    backend.remove_card(DEFAULT_READER);
    backend.insert_card(DEFAULT_READER, VirtualCard::cie().unwrap());
    assert_eq!(kind(provider.sign(session, b"data")), ErrorKind::DeviceRemoved);
    assert_eq!(kind(provider.session_info(session)), ErrorKind::DeviceRemoved);
    assert_eq!(provider.wait_for_slot_event(false).unwrap(), 0);
}

#[test]
fn test_slot_events() {
    let (backend, provider) = provider();
    assert_eq!(kind(provider.wait_for_slot_event(false)), ErrorKind::NoEvent);

    backend.remove_card(DEFAULT_READER);
    assert_eq!(provider.wait_for_slot_event(false).unwrap(), 0);
    assert_eq!(kind(provider.wait_for_slot_event(false)), ErrorKind::NoEvent);

    let inserter = {
        let backend = backend.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            backend.insert_card(DEFAULT_READER, VirtualCard::cie().unwrap());
        })
    };
    assert_eq!(provider.wait_for_slot_event(true).unwrap(), 0);
    inserter.join().unwrap();
    assert_eq!(provider.slot_list(true), [0]);
}

#[test]
fn test_shutdown_interrupts_wait() {
    let (_, provider) = provider();
    let provider = Arc::new(provider);
    let waiter = {
        let provider = provider.clone();
        thread::spawn(move || provider.wait_for_slot_event(true))
    };
    thread::sleep(Duration::from_millis(100));
    provider.shutdown();
    assert_eq!(kind(waiter.join().unwrap()), ErrorKind::NotInitialized);
}

#[test]
fn test_concurrent_sessions() {
    let (_, provider) = provider();
    let provider = Arc::new(provider);
    let workers: Vec<_> = (0..4)
        .map(|n| {
            let provider = provider.clone();
            thread::spawn(move || {
                let session = provider.open_session(0, RO).unwrap();
                provider.login(session, CKU_USER, DEFAULT_PIN).unwrap();
                let data = format!("message {n}");
                let signature = sign(&provider, session, Mechanism::Sha256RsaPkcs, data.as_bytes());
                verify(&provider, session, Mechanism::Sha256RsaPkcs, data.as_bytes(), &signature)
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap().unwrap();
    }
}

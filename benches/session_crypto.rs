use criterion::{criterion_group, criterion_main, Criterion};
use tpmtok_core::mechanism::{CKM_AES_CBC_PAD, CKM_AES_KEY_GEN, CKM_GENERIC_SECRET_KEY_GEN, CKM_SHA256_HMAC};
use tpmtok_core::object::{CKA_TOKEN, CKA_VALUE_LEN};
use tpmtok_core::tpm::StubTpm;
use tpmtok_core::{Attribute, OperationType, ServiceConfig, SlotManager, DEFAULT_ISOLATE};

fn bench_session_crypto(c: &mut Criterion) {
    let dir = std::env::temp_dir().join(format!("tpmtok-bench-{}", uuid::Uuid::new_v4()));
    let manager = SlotManager::with_tpm(ServiceConfig::default(), Box::new(StubTpm)).unwrap();
    let slot = manager.load_token(&DEFAULT_ISOLATE, &dir, b"bench", "bench").unwrap();
    let handle = manager.open_session(&DEFAULT_ISOLATE, slot, false).unwrap();
    let shared = manager.get_session(&DEFAULT_ISOLATE, handle).unwrap();
    let mut session = shared.lock();

    let aes = session
        .generate_key(
            CKM_AES_KEY_GEN,
            &[Attribute::ulong(CKA_VALUE_LEN, 32), Attribute::bool(CKA_TOKEN, false)],
        )
        .unwrap();
    let hmac = session
        .generate_key(
            CKM_GENERIC_SECRET_KEY_GEN,
            &[Attribute::ulong(CKA_VALUE_LEN, 32), Attribute::bool(CKA_TOKEN, false)],
        )
        .unwrap();
    let iv = [0x24u8; 16];
    let data = vec![0x5au8; 4096];

    c.bench_function("aes256_cbc_pad_encrypt_4k", |b| {
        b.iter(|| {
            session
                .operation_init(OperationType::Encrypt, CKM_AES_CBC_PAD, &iv, Some(aes))
                .unwrap();
            session
                .operation_single_part(OperationType::Encrypt, &data, data.len() + 16)
                .unwrap()
        })
    });

    c.bench_function("hmac_sha256_sign_4k", |b| {
        b.iter(|| {
            session
                .operation_init(OperationType::Sign, CKM_SHA256_HMAC, &[], Some(hmac))
                .unwrap();
            session.operation_single_part(OperationType::Sign, &data, 32).unwrap()
        })
    });

    drop(session);
    drop(manager);
    let _ = std::fs::remove_dir_all(&dir);
}

criterion_group!(benches, bench_session_crypto);
criterion_main!(benches);

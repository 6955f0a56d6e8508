//! End-to-end vault lifecycle scenarios over an in-memory store.

use std::sync::Arc;

use burrow_core::config::CryptoConfig;
use burrow_crypto::kdf::derive_root_pair;
use burrow_crypto::{derive_cipher_key, is_cipher_key, open_entry, root_signature, seal_entry};
use burrow_vault::{
    DomainSpec, KvStore, MemorySessionCache, Migrations, SchemaDescriptor, SecretString,
    StorageStrategy, VaultBase, VaultConfig, VaultError, VaultSession, BASE_KEY,
};
use serde_json::json;

fn fast_config() -> VaultConfig {
    VaultConfig {
        crypto: CryptoConfig {
            argon2_mem_cost_kib: 1024,
            argon2_time_cost: 1,
            argon2_parallelism: 1,
        },
        ..VaultConfig::default()
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn session(store: &KvStore) -> VaultSession {
    init_tracing();
    VaultSession::new(
        store.clone(),
        fast_config(),
        Arc::new(MemorySessionCache::new()),
    )
}

fn chains_spec() -> DomainSpec {
    DomainSpec::new(
        "chains",
        StorageStrategy::Default,
        SchemaDescriptor {
            version: 1,
            shape: json!(["ref"]),
        },
    )
}

async fn registered_vault(store: &KvStore, passphrase: &str) -> VaultSession {
    let mut s = session(store);
    s.connect().await.unwrap();
    s.register(SecretString::from(passphrase)).await.unwrap();
    s
}

#[tokio::test]
async fn test_register_then_unlock_with_correct_passphrase() {
    let store = KvStore::memory();
    let mut s = registered_vault(&store, "correct-horse").await;
    let nonce_at_register = VaultBase::load(&store).await.unwrap().unwrap().nonce().unwrap();
    s.lock().await;
    assert!(!s.is_unlocked());

    let mut fresh = session(&store);
    fresh.connect().await.unwrap();
    fresh
        .unlock(SecretString::from("correct-horse"), false, None)
        .await
        .unwrap();

    assert!(fresh.is_unlocked());
    // Every unlock advances the root generation by one.
    let base = VaultBase::load(&store).await.unwrap().unwrap();
    assert_eq!(base.nonce().unwrap(), nonce_at_register.wrapping_add(1));
}

#[tokio::test]
async fn test_wrong_passphrase_leaves_base_untouched() {
    let store = KvStore::memory();
    let mut s = registered_vault(&store, "correct-horse").await;
    s.lock().await;

    let base_before = store.get(BASE_KEY).await.unwrap().unwrap();

    let mut fresh = session(&store);
    fresh.connect().await.unwrap();
    let err = fresh
        .unlock(SecretString::from("wrong"), false, None)
        .await
        .unwrap_err();

    assert!(matches!(err, VaultError::InvalidPassphrase));
    assert!(!fresh.is_unlocked());
    assert_eq!(store.get(BASE_KEY).await.unwrap().unwrap(), base_before);
}

#[tokio::test]
async fn test_put_then_get_returns_equal_value() {
    let store = KvStore::memory();
    let mut s = registered_vault(&store, "pw").await;
    s.open(&[chains_spec()], &Migrations::new()).await.unwrap();

    let tuple = vec![json!({ "ref": "test" })];
    s.put("chains", "cosmos:secret-4", tuple.clone())
        .await
        .unwrap();

    let read = s.get("chains", "cosmos:secret-4").await.unwrap();
    assert_eq!(read, Some(tuple));

    // Exactly one item, under a non-zero code.
    let entries = s.item_entries().await.unwrap();
    assert_eq!(entries.len(), 1);
    assert!(entries[0].1 > 0);
    assert!(entries[0].0.ends_with(":cosmos:secret-4"));
    s.lock().await;
}

#[tokio::test]
async fn test_thousand_items_respect_bucket_capacity() {
    let store = KvStore::memory();
    let mut s = registered_vault(&store, "pw").await;
    s.open(&[chains_spec()], &Migrations::new()).await.unwrap();

    for i in 0..1000 {
        s.put("chains", &format!("item-{i}"), vec![json!(format!("ref-{i}"))])
            .await
            .unwrap();
    }

    let bucket_length = fast_config().hub.bucket_length;
    let stats = s.bucket_stats().await.unwrap();
    assert!(stats.len() > 1, "items spilled across buckets");
    for (key, size) in stats {
        assert!(
            size <= bucket_length,
            "bucket {key} tracked size {size} exceeds {bucket_length}"
        );
    }

    assert_eq!(s.item_entries().await.unwrap().len(), 1000);
    s.lock().await;
}

#[tokio::test]
async fn test_unlock_resumes_after_crash_mid_rotation() {
    let store = KvStore::memory();
    let mut s = registered_vault(&store, "correct-horse").await;
    s.open(&[chains_spec()], &Migrations::new()).await.unwrap();
    for i in 0..20 {
        s.put("chains", &format!("item-{i}"), vec![json!(format!("ref-{i}"))])
            .await
            .unwrap();
    }
    s.lock().await;

    // Re-encrypt half the entries under the next generation, as if a
    // rotation died partway: base metadata still names the current
    // generation, storage is mixed.
    let base = VaultBase::load(&store).await.unwrap().unwrap();
    let salt = base.salt().unwrap();
    let pair = derive_root_pair(
        SecretString::from("correct-horse"),
        &base.entropy().unwrap(),
        base.nonce().unwrap(),
        &base.params,
    )
    .unwrap();
    let cipher_old = derive_cipher_key(&pair.old, &salt, false);
    let cipher_new = derive_cipher_key(&pair.new, &salt, true);

    let keys: Vec<String> = store
        .all_keys()
        .await
        .unwrap()
        .into_iter()
        .filter(|k| is_cipher_key(k))
        .collect();
    assert!(keys.len() >= 2);
    for key in keys.iter().take(keys.len() / 2) {
        let value = store.get(key).await.unwrap().unwrap();
        let plaintext = open_entry(key, &value, &cipher_old, pair.old.vector()).unwrap();
        let sealed = seal_entry(key, &plaintext, &cipher_new, pair.new.vector()).unwrap();
        store.set(key, sealed).await.unwrap();
    }

    // Same passphrase, plain unlock: the signature still verifies
    // under the old generation, so rotation resumes and finishes.
    let mut fresh = session(&store);
    fresh.connect().await.unwrap();
    fresh
        .unlock(SecretString::from("correct-horse"), false, None)
        .await
        .unwrap();
    fresh
        .open(&[chains_spec()], &Migrations::new())
        .await
        .unwrap();

    for i in 0..20 {
        let read = fresh.get("chains", &format!("item-{i}")).await.unwrap();
        assert_eq!(read, Some(vec![json!(format!("ref-{i}"))]));
    }
    fresh.lock().await;
}

#[tokio::test]
async fn test_advanced_signature_requires_recovering_acknowledgement() {
    let store = KvStore::memory();
    let mut s = registered_vault(&store, "pw").await;
    s.lock().await;

    // Forge the state where the stored signature already belongs to
    // the next generation while the nonce does not.
    let mut base = VaultBase::load(&store).await.unwrap().unwrap();
    let nonce = base.nonce().unwrap();
    let salt = base.salt().unwrap();
    let pair = derive_root_pair(
        SecretString::from("pw"),
        &base.entropy().unwrap(),
        nonce,
        &base.params,
    )
    .unwrap();
    base.set_generation(nonce, &root_signature(&pair.new, &salt));
    base.save(&store).await.unwrap();

    let mut fresh = session(&store);
    fresh.connect().await.unwrap();
    let err = fresh
        .unlock(SecretString::from("pw"), false, None)
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::Recoverable));

    let mut acknowledged = session(&store);
    acknowledged.connect().await.unwrap();
    acknowledged
        .unlock(SecretString::from("pw"), true, None)
        .await
        .unwrap();
    assert!(acknowledged.is_unlocked());
}

#[tokio::test]
async fn test_vault_persists_across_processes_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_str().unwrap();

    {
        let store = KvStore::fs(root).unwrap();
        let mut s = registered_vault(&store, "pw").await;
        s.open(&[chains_spec()], &Migrations::new()).await.unwrap();
        s.put("chains", "cosmoshub", vec![json!("ref-hub")])
            .await
            .unwrap();
        s.lock().await;
        s.close().await;
    }

    // A fresh store over the same directory sees the same vault.
    let store = KvStore::fs(root).unwrap();
    let mut s = session(&store);
    s.connect().await.unwrap();
    s.unlock(SecretString::from("pw"), false, None)
        .await
        .unwrap();
    s.open(&[chains_spec()], &Migrations::new()).await.unwrap();

    assert_eq!(
        s.get("chains", "cosmoshub").await.unwrap(),
        Some(vec![json!("ref-hub")])
    );
    s.lock().await;
}

#[tokio::test]
async fn test_rotation_reports_progress() {
    let store = KvStore::memory();
    let mut s = registered_vault(&store, "pw").await;
    s.open(&[chains_spec()], &Migrations::new()).await.unwrap();
    for i in 0..5 {
        s.put("chains", &format!("item-{i}"), vec![json!(i)])
            .await
            .unwrap();
    }
    s.lock().await;

    let seen = std::sync::Mutex::new(Vec::new());
    let report = |done: usize, total: usize| {
        seen.lock().unwrap().push((done, total));
    };
    let report: &(dyn Fn(usize, usize) + Sync) = &report;

    let mut fresh = session(&store);
    fresh.connect().await.unwrap();
    fresh
        .unlock(SecretString::from("pw"), false, Some(report))
        .await
        .unwrap();

    let seen = seen.into_inner().unwrap();
    let (done, total) = *seen.last().unwrap();
    assert_eq!(done, total);
    assert!(total >= 2, "hub entry plus at least one bucket");
}

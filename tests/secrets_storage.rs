//! Secret store encryption and capability storage semantics.

use std::sync::Arc;

use serde_json::{json, Map};
use toolsmith::capabilities::crypto;
use toolsmith::capabilities::{Catalog, NewCapability, SecretStore, StorageStore};
use toolsmith::store::Database;

fn setup() -> (tempfile::TempDir, Arc<Database>, String) {
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(Database::open(dir.path()).unwrap());
    let catalog = Catalog::new(db.clone(), dir.path().join("capabilities"));
    let cap = catalog
        .create(NewCapability {
            name: "mailer".into(),
            description: "send mail".into(),
            ..Default::default()
        })
        .unwrap();
    (dir, db, cap.id)
}

#[test]
fn secrets_are_encrypted_at_rest() {
    let (_dir, db, id) = setup();
    let store = SecretStore::new(db.clone(), [9u8; 32]);
    store.set(&id, "SMTP_PASSWORD", "hunter2-very-secret").unwrap();

    let raw: String = db
        .with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT encrypted_value FROM capability_secrets WHERE capability_id = ?1",
                [&id],
                |r| r.get(0),
            )?)
        })
        .unwrap();
    assert!(!raw.contains("hunter2"));

    let all = store.get_all(&id).unwrap();
    assert_eq!(all.get("SMTP_PASSWORD").map(String::as_str), Some("hunter2-very-secret"));
}

#[test]
fn last_write_wins_and_keys_are_listed() {
    let (_dir, db, id) = setup();
    let store = SecretStore::new(db, [9u8; 32]);
    store.set(&id, "TOKEN", "one").unwrap();
    store.set(&id, "TOKEN", "two").unwrap();
    store.set(&id, "API_KEY", "k").unwrap();

    assert_eq!(store.keys(&id).unwrap(), vec!["API_KEY", "TOKEN"]);
    assert_eq!(store.get_all(&id).unwrap()["TOKEN"], "two");

    assert!(store.delete(&id, "TOKEN").unwrap());
    assert!(!store.delete(&id, "TOKEN").unwrap());
    assert_eq!(store.keys(&id).unwrap(), vec!["API_KEY"]);
}

#[test]
fn wrong_key_omits_secret_instead_of_failing() {
    let (_dir, db, id) = setup();
    SecretStore::new(db.clone(), [1u8; 32])
        .set(&id, "TOKEN", "abc")
        .unwrap();

    let other = SecretStore::new(db, [2u8; 32]);
    let all = other.get_all(&id).unwrap();
    assert!(all.is_empty());
    // names are still visible without decryption
    assert_eq!(other.keys(&id).unwrap(), vec!["TOKEN"]);
}

#[test]
fn corrupted_ciphertext_omits_only_that_secret() {
    let (_dir, db, id) = setup();
    let store = SecretStore::new(db.clone(), [4u8; 32]);
    store.set(&id, "KEY", "v").unwrap();
    store.set(&id, "OTHER", "w").unwrap();

    let overwrite = |value: &str| {
        db.with_conn(|conn| {
            conn.execute(
                "UPDATE capability_secrets SET encrypted_value = ?1
                 WHERE capability_id = ?2 AND key = 'KEY'",
                [value, id.as_str()],
            )?;
            Ok(())
        })
        .unwrap();
    };

    // not base64 at all
    overwrite("!!notbase64");
    let all = store.get_all(&id).unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all["OTHER"], "w");

    // valid base64, shorter than a nonce
    overwrite("AAAAAAA=");
    let all = store.get_all(&id).unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all["OTHER"], "w");
    assert_eq!(store.keys(&id).unwrap(), vec!["KEY", "OTHER"]);
}

#[test]
fn secrets_require_an_existing_capability() {
    let (_dir, db, _id) = setup();
    let store = SecretStore::new(db, [1u8; 32]);
    assert!(store.set("no-such-capability", "TOKEN", "x").is_err());
    assert!(store.set("also-missing", "  ", "x").is_err());
}

#[test]
fn key_file_is_created_once_and_reused() {
    let dir = tempfile::tempdir().unwrap();
    let secrets_dir = dir.path().join(".secrets");
    let first = crypto::load_or_create_key(&secrets_dir).unwrap();
    let second = crypto::load_or_create_key(&secrets_dir).unwrap();
    assert_eq!(first, second);

    let sealed = crypto::encrypt(&first, b"payload").unwrap();
    assert_eq!(crypto::decrypt(&second, &sealed).unwrap(), b"payload");
}

#[test]
fn storage_merge_keeps_untouched_keys() {
    let (_dir, db, id) = setup();
    let storage = StorageStore::new(db);

    let mut first = Map::new();
    first.insert("sent".into(), json!(1));
    first.insert("last_to".into(), json!("ada@example.com"));
    storage.merge(&id, &first).unwrap();

    let mut second = Map::new();
    second.insert("sent".into(), json!(2));
    second.insert("history".into(), json!(["ada@example.com"]));
    storage.merge(&id, &second).unwrap();

    let state = storage.get(&id).unwrap();
    assert_eq!(state["sent"], json!(2));
    assert_eq!(state["last_to"], json!("ada@example.com"));
    assert_eq!(state["history"], json!(["ada@example.com"]));

    assert!(storage.delete_key(&id, "history").unwrap());
    assert_eq!(storage.clear(&id).unwrap(), 2);
    assert!(storage.get(&id).unwrap().is_empty());
}

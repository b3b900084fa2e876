use rc_core::store::AccountStore;
use rc_core::types::{AccountRecord, AuthMode};
use rc_daemon::store::JsonFileStore;

fn record(username: &str) -> AccountRecord {
    AccountRecord::new(username, AuthMode::CookieOnly, chrono::Utc::now())
}

#[tokio::test]
async fn records_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data/accounts.json");
    let key = dir.path().join("keys/store.key");

    let store = JsonFileStore::open(&path, &key, Vec::new()).await.unwrap();
    assert!(store.load_accounts().await.unwrap().is_empty());

    let mut rec = record("3200100001");
    rec.cookie_enc = Some(store.encrypt_secret("session=abc").unwrap());
    store.save_accounts(&[rec.clone()]).await.unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    assert!(!text.contains("session=abc"));

    let reopened = JsonFileStore::open(&path, &key, Vec::new()).await.unwrap();
    let loaded = reopened.load_accounts().await.unwrap();
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].id, rec.id);
    let sealed = loaded[0].cookie_enc.as_deref().unwrap();
    assert_eq!(reopened.decrypt_secret(sealed).unwrap(), "session=abc");
}

#[tokio::test]
async fn another_key_cannot_open_secrets() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("accounts.json");
    let a = JsonFileStore::open(&path, dir.path().join("a.key"), Vec::new())
        .await
        .unwrap();
    let b = JsonFileStore::open(&path, dir.path().join("b.key"), Vec::new())
        .await
        .unwrap();

    let sealed = a.encrypt_secret("pw").unwrap();
    assert!(b.decrypt_secret(&sealed).is_err());
}

#[cfg(unix)]
#[tokio::test]
async fn key_file_is_private() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let key = dir.path().join("store.key");
    JsonFileStore::open(dir.path().join("accounts.json"), &key, Vec::new())
        .await
        .unwrap();
    let mode = std::fs::metadata(&key).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600);
}

#[tokio::test]
async fn invites_are_consumed_once_across_restarts() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("accounts.json");
    let key = dir.path().join("store.key");
    let codes = || vec!["WELCOME".to_string(), " SPARE ".to_string()];

    let store = JsonFileStore::open(&path, &key, codes()).await.unwrap();
    store.save_accounts(&[record("3200100001")]).await.unwrap();
    assert!(!store.consume_invite("UNKNOWN").await.unwrap());
    assert!(store.consume_invite("WELCOME").await.unwrap());
    assert!(!store.consume_invite("WELCOME").await.unwrap());

    let reopened = JsonFileStore::open(&path, &key, codes()).await.unwrap();
    assert!(!reopened.consume_invite("WELCOME").await.unwrap());
    assert!(reopened.consume_invite("SPARE").await.unwrap());
    // Consuming invites leaves the records alone.
    assert_eq!(reopened.load_accounts().await.unwrap().len(), 1);
}

#[tokio::test]
async fn corrupt_document_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("accounts.json");
    std::fs::write(&path, "{ not json").unwrap();
    let store = JsonFileStore::open(&path, dir.path().join("store.key"), Vec::new())
        .await
        .unwrap();
    assert!(store.load_accounts().await.is_err());
}

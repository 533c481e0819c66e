#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::BTreeMap;
    use std::fs;
    use std::path::{Path, MAIN_SEPARATOR};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use serde::Deserialize;
    use tempfile::TempDir;
    use walkdir::WalkDir;

    use certstore_migrator::backend::file::FileStorage;
    use certstore_migrator::backend::{
        KeyInfo, ProvisionContext, Provisioner, Registry, Storage, StorageEntry, StorageError,
        Validator,
    };
    use certstore_migrator::operations::{
        export_files, import_files, import_files_with_options, ImportOptions,
    };
    use certstore_migrator::MigrateError;

    thread_local! {
        static EVENTS: RefCell<Vec<String>> = RefCell::new(Vec::new());
    }

    fn record(event: String) {
        EVENTS.with(|events| events.borrow_mut().push(event));
    }

    fn take_events() -> Vec<String> {
        EVENTS.with(|events| events.borrow_mut().drain(..).collect())
    }

    #[derive(Default, Deserialize)]
    #[serde(default)]
    struct DummyStorage {
        value: String,
        /// Hand back altered bytes from `load`.
        corrupt: bool,
        fail_provision: bool,
        /// Refuse every store call after this many have succeeded.
        fail_store_after: Option<usize>,
        #[serde(skip)]
        store_calls: AtomicUsize,
        #[serde(skip)]
        stored: Mutex<BTreeMap<String, Vec<u8>>>,
    }

    impl Storage for DummyStorage {
        fn name(&self) -> &str {
            "dummy"
        }

        fn store(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
            let calls = self.store_calls.fetch_add(1, Ordering::SeqCst);
            if matches!(self.fail_store_after, Some(limit) if calls >= limit) {
                return Err(StorageError::Other("quota exceeded".to_string()));
            }
            record(format!("store:{}", key));
            self.stored.lock().unwrap().insert(key.to_string(), value.to_vec());
            Ok(())
        }

        fn load(&self, key: &str) -> Result<Vec<u8>, StorageError> {
            let mut value = self
                .stored
                .lock()
                .unwrap()
                .get(key)
                .cloned()
                .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
            if self.corrupt {
                value.push(b'!');
            }
            Ok(value)
        }

        fn delete(&self, key: &str) -> Result<(), StorageError> {
            self.stored.lock().unwrap().remove(key);
            Ok(())
        }

        fn list(&self, prefix: &str, _recursive: bool) -> Result<Vec<String>, StorageError> {
            Ok(self
                .stored
                .lock()
                .unwrap()
                .keys()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect())
        }

        fn stat(&self, key: &str) -> Result<KeyInfo, StorageError> {
            let stored = self.stored.lock().unwrap();
            let value = stored
                .get(key)
                .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
            Ok(KeyInfo {
                key: key.to_string(),
                modified: None,
                size: value.len() as u64,
                is_terminal: true,
            })
        }

        fn lock(&self, _key: &str) -> Result<(), StorageError> {
            Ok(())
        }

        fn unlock(&self, _key: &str) -> Result<(), StorageError> {
            Ok(())
        }

        fn as_provisioner(&mut self) -> Option<&mut dyn Provisioner> {
            Some(self)
        }

        fn as_validator(&self) -> Option<&dyn Validator> {
            Some(self)
        }
    }

    impl Provisioner for DummyStorage {
        fn provision(&mut self, ctx: &ProvisionContext) -> Result<(), StorageError> {
            assert!(ctx.config.storage_name.is_none());
            record("provision".to_string());
            if self.fail_provision {
                return Err(StorageError::Connection("refused".to_string()));
            }
            Ok(())
        }
    }

    impl Validator for DummyStorage {
        fn validate(&self) -> Result<(), StorageError> {
            record(format!("validate:{}", self.value));
            Ok(())
        }
    }

    static CONSTRUCTED: AtomicUsize = AtomicUsize::new(0);

    #[derive(Deserialize)]
    struct CountingStorage {}

    impl Default for CountingStorage {
        fn default() -> Self {
            CONSTRUCTED.fetch_add(1, Ordering::SeqCst);
            Self {}
        }
    }

    impl Storage for CountingStorage {
        fn name(&self) -> &str {
            "counting"
        }

        fn store(&self, _key: &str, _value: &[u8]) -> Result<(), StorageError> {
            Ok(())
        }

        fn load(&self, key: &str) -> Result<Vec<u8>, StorageError> {
            Err(StorageError::NotFound(key.to_string()))
        }

        fn delete(&self, _key: &str) -> Result<(), StorageError> {
            Ok(())
        }

        fn list(&self, _prefix: &str, _recursive: bool) -> Result<Vec<String>, StorageError> {
            Ok(Vec::new())
        }

        fn stat(&self, key: &str) -> Result<KeyInfo, StorageError> {
            Err(StorageError::NotFound(key.to_string()))
        }

        fn lock(&self, _key: &str) -> Result<(), StorageError> {
            Ok(())
        }

        fn unlock(&self, _key: &str) -> Result<(), StorageError> {
            Ok(())
        }
    }

    fn registry() -> Registry {
        let mut registry = Registry::with_builtin();
        registry.register(StorageEntry::of::<DummyStorage>("dummy")).unwrap();
        registry.register(StorageEntry::of::<CountingStorage>("counting")).unwrap();
        registry
    }

    fn setup_source_dir() -> TempDir {
        let dir = TempDir::new().unwrap();
        let path = dir.path();

        fs::create_dir_all(path.join("certificates/acme-v02/example.com")).unwrap();
        fs::create_dir_all(path.join("acme/accounts")).unwrap();
        fs::create_dir_all(path.join("empty")).unwrap();
        fs::write(
            path.join("certificates/acme-v02/example.com/example.com.crt"),
            "-----BEGIN CERTIFICATE-----",
        )
        .unwrap();
        fs::write(
            path.join("certificates/acme-v02/example.com/example.com.key"),
            vec![0u8, 159, 146, 150, 255],
        )
        .unwrap();
        fs::write(path.join("acme/accounts/account.json"), "{\"status\":\"valid\"}").unwrap();
        fs::write(path.join("last_clean.json"), "").unwrap();

        dir
    }

    fn read_tree(root: &Path) -> BTreeMap<String, Vec<u8>> {
        WalkDir::new(root)
            .min_depth(1)
            .into_iter()
            .map(|e| e.unwrap())
            .filter(|e| e.file_type().is_file())
            .map(|e| {
                let rel = e.path().strip_prefix(root).unwrap();
                let key = rel
                    .components()
                    .map(|c| c.as_os_str().to_str().unwrap())
                    .collect::<Vec<_>>()
                    .join("/");
                (key, fs::read(e.path()).unwrap())
            })
            .collect()
    }

    #[test]
    fn test_init_storage_unknown_name() {
        let registry = registry();
        let result = registry.init_storage("dumy", b"");
        assert!(matches!(result, Err(MigrateError::BackendNotFound(ref name)) if name == "dumy"));

        let before = CONSTRUCTED.load(Ordering::SeqCst);
        assert!(registry.init_storage("countin", b"").is_err());
        assert_eq!(CONSTRUCTED.load(Ordering::SeqCst), before);

        registry.init_storage("counting", b"").unwrap();
        assert_eq!(CONSTRUCTED.load(Ordering::SeqCst), before + 1);
    }

    #[test]
    fn test_init_storage_applies_config_then_provisions_and_validates() {
        take_events();
        let registry = registry();

        let storage = registry
            .init_storage("dummy", br#"{"value": "test json unmarshal", "extra": [1, 2]}"#)
            .unwrap();

        assert_eq!(storage.name(), "dummy");
        assert_eq!(
            take_events(),
            vec!["provision".to_string(), "validate:test json unmarshal".to_string()]
        );
    }

    #[test]
    fn test_init_storage_without_config_uses_defaults() {
        take_events();
        registry().init_storage("dummy", b"").unwrap();
        assert_eq!(take_events(), vec!["provision".to_string(), "validate:".to_string()]);
    }

    #[test]
    fn test_init_storage_type_mismatch() {
        let result = registry().init_storage("dummy", br#"{"value": 5}"#);
        assert!(matches!(result, Err(MigrateError::ConfigParse(_))));
    }

    #[test]
    fn test_init_storage_provision_failure_skips_validate() {
        take_events();
        let result = registry().init_storage("dummy", br#"{"fail_provision": true}"#);
        assert!(matches!(result, Err(MigrateError::Provision { ref name, .. }) if name == "dummy"));
        assert_eq!(take_events(), vec!["provision".to_string()]);
    }

    #[test]
    fn test_import_single_file() {
        let source = TempDir::new().unwrap();
        fs::write(source.path().join("key1"), "AAAA").unwrap();

        let storage = registry().init_storage("dummy", b"").unwrap();
        let stats = import_files(storage.as_ref(), source.path()).unwrap();

        assert_eq!(stats.files, 1);
        assert_eq!(stats.bytes, 4);
        let key = format!("{}key1", MAIN_SEPARATOR);
        assert_eq!(storage.load(&key).unwrap(), b"AAAA");
        assert!(storage.exists(&key));
    }

    #[test]
    fn test_import_nonexistent_source() {
        take_events();
        let temp_dir = TempDir::new().unwrap();
        let storage = registry().init_storage("dummy", b"").unwrap();
        take_events();

        let result = import_files(storage.as_ref(), temp_dir.path().join("missing"));

        assert!(matches!(result, Err(MigrateError::Filesystem { .. })));
        assert!(take_events().is_empty());
        assert!(storage.list("", true).unwrap().is_empty());
    }

    #[test]
    fn test_import_file_as_source() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("cert.pem");
        fs::write(&file, "x").unwrap();

        let storage = registry().init_storage("dummy", b"").unwrap();
        let result = import_files(storage.as_ref(), &file);
        assert!(matches!(result, Err(MigrateError::Filesystem { .. })));
    }

    #[test]
    fn test_import_store_error_aborts() {
        let source = setup_source_dir();
        let storage = registry()
            .init_storage("dummy", br#"{"fail_store_after": 2}"#)
            .unwrap();

        let result = import_files(storage.as_ref(), source.path());

        match result {
            Err(MigrateError::Storage { key, source }) => {
                assert!(key.starts_with(MAIN_SEPARATOR));
                assert!(matches!(source, StorageError::Other(_)));
            }
            other => panic!("Expected storage error, got {:?}", other),
        }
        assert_eq!(storage.list("", true).unwrap().len(), 2);
    }

    #[cfg(unix)]
    #[test]
    fn test_import_read_error_aborts() {
        let source = TempDir::new().unwrap();
        std::os::unix::fs::symlink(source.path().join("gone.pem"), source.path().join("dangling.pem"))
            .unwrap();

        let storage = registry().init_storage("dummy", b"").unwrap();
        let result = import_files(storage.as_ref(), source.path());

        match result {
            Err(MigrateError::Filesystem { path, .. }) => assert!(path.ends_with("dangling.pem")),
            other => panic!("Expected filesystem error, got {:?}", other),
        }
        assert!(storage.list("", true).unwrap().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_import_skips_unreadable_directory() {
        use std::os::unix::fs::PermissionsExt;

        let source = setup_source_dir();
        let private = source.path().join("private");
        fs::create_dir(&private).unwrap();
        fs::write(private.join("hidden.key"), "secret").unwrap();
        fs::set_permissions(&private, fs::Permissions::from_mode(0o000)).unwrap();

        // Permission bits don't stop a privileged user.
        if fs::read_dir(&private).is_ok() {
            fs::set_permissions(&private, fs::Permissions::from_mode(0o700)).unwrap();
            return;
        }

        let storage = registry().init_storage("dummy", b"").unwrap();
        let result = import_files(storage.as_ref(), source.path());
        fs::set_permissions(&private, fs::Permissions::from_mode(0o700)).unwrap();

        assert_eq!(result.unwrap().files, 4);
        let keys = storage.list("", true).unwrap();
        assert!(keys.iter().all(|k| !k.contains("hidden.key")));
    }

    #[test]
    fn test_import_verify_detects_mismatch() {
        let source = setup_source_dir();
        let storage = registry().init_storage("dummy", br#"{"corrupt": true}"#).unwrap();

        let opts = ImportOptions { verify: true };
        let result = import_files_with_options(storage.as_ref(), source.path(), &opts);
        assert!(matches!(result, Err(MigrateError::ChecksumMismatch { .. })));

        let storage = registry().init_storage("dummy", b"").unwrap();
        let stats = import_files_with_options(storage.as_ref(), source.path(), &opts).unwrap();
        assert_eq!(stats.files, 4);
    }

    #[test]
    fn test_export_single_key() {
        let storage = registry().init_storage("dummy", b"").unwrap();
        storage.store("cert1", b"THIS IS A CERT").unwrap();

        let dest = TempDir::new().unwrap();
        let stats = export_files(storage.as_ref(), dest.path()).unwrap();

        assert_eq!(stats.files, 1);
        assert_eq!(fs::read(dest.path().join("cert1")).unwrap(), b"THIS IS A CERT");
    }

    #[test]
    fn test_export_empty_storage() {
        let storage = registry().init_storage("dummy", b"").unwrap();
        let dest = TempDir::new().unwrap();
        let target = dest.path().join("out");

        let stats = export_files(storage.as_ref(), &target).unwrap();

        assert_eq!(stats.files, 0);
        assert!(target.is_dir());
        assert_eq!(fs::read_dir(&target).unwrap().count(), 0);
    }

    #[test]
    fn test_export_overwrites_existing_file() {
        let storage = registry().init_storage("dummy", b"").unwrap();
        storage.store("/certificates/a.crt", b"new").unwrap();

        let dest = TempDir::new().unwrap();
        fs::create_dir_all(dest.path().join("certificates")).unwrap();
        fs::write(dest.path().join("certificates/a.crt"), "old and longer").unwrap();

        export_files(storage.as_ref(), dest.path()).unwrap();
        assert_eq!(fs::read(dest.path().join("certificates/a.crt")).unwrap(), b"new");
    }

    #[test]
    fn test_export_write_failure_is_reported() {
        let storage = registry().init_storage("dummy", b"").unwrap();
        storage.store("a", b"file").unwrap();
        storage.store("a/b", b"nested below a file").unwrap();

        let dest = TempDir::new().unwrap();
        let result = export_files(storage.as_ref(), dest.path());
        assert!(matches!(result, Err(MigrateError::Filesystem { .. })));
    }

    #[test]
    fn test_export_rejects_key_outside_destination() {
        let storage = registry().init_storage("dummy", b"").unwrap();
        storage.store("../escaped", b"x").unwrap();

        let temp_dir = TempDir::new().unwrap();
        let dest = temp_dir.path().join("dest");
        let result = export_files(storage.as_ref(), &dest);

        assert!(matches!(result, Err(MigrateError::InvalidKey(_))));
        assert!(!temp_dir.path().join("escaped").exists());
    }

    #[test]
    fn test_export_load_error_aborts() {
        struct ListOnly;
        impl Storage for ListOnly {
            fn name(&self) -> &str {
                "list-only"
            }
            fn store(&self, _key: &str, _value: &[u8]) -> Result<(), StorageError> {
                Ok(())
            }
            fn load(&self, key: &str) -> Result<Vec<u8>, StorageError> {
                Err(StorageError::NotFound(key.to_string()))
            }
            fn delete(&self, _key: &str) -> Result<(), StorageError> {
                Ok(())
            }
            fn list(&self, _prefix: &str, _recursive: bool) -> Result<Vec<String>, StorageError> {
                Ok(vec!["ghost".to_string(), "other".to_string()])
            }
            fn stat(&self, key: &str) -> Result<KeyInfo, StorageError> {
                Err(StorageError::NotFound(key.to_string()))
            }
            fn lock(&self, _key: &str) -> Result<(), StorageError> {
                Ok(())
            }
            fn unlock(&self, _key: &str) -> Result<(), StorageError> {
                Ok(())
            }
        }

        let dest = TempDir::new().unwrap();
        let result = export_files(&ListOnly, dest.path());
        match result {
            Err(MigrateError::Storage { key, source }) => {
                assert_eq!(key, "ghost");
                assert!(source.is_not_found());
            }
            other => panic!("Expected storage error, got {:?}", other),
        }
        assert_eq!(fs::read_dir(dest.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_round_trip_through_dummy_storage() {
        let source = setup_source_dir();
        let storage = registry().init_storage("dummy", b"").unwrap();

        let imported = import_files(storage.as_ref(), source.path()).unwrap();
        let dest = TempDir::new().unwrap();
        let exported = export_files(storage.as_ref(), dest.path()).unwrap();

        assert_eq!(imported, exported);
        assert_eq!(read_tree(source.path()), read_tree(dest.path()));
        assert!(!dest.path().join("empty").exists());
    }

    #[test]
    fn test_round_trip_through_file_storage() {
        let source = setup_source_dir();
        let store_dir = TempDir::new().unwrap();
        let config = serde_json::to_vec(&serde_json::json!({
            "root": store_dir.path().join("store"),
        }))
        .unwrap();

        let storage = registry().init_storage("file", &config).unwrap();
        import_files(storage.as_ref(), source.path()).unwrap();

        let mut keys = storage.list("", true).unwrap();
        keys.sort();
        assert_eq!(
            keys,
            vec![
                "acme/accounts/account.json",
                "certificates/acme-v02/example.com/example.com.crt",
                "certificates/acme-v02/example.com/example.com.key",
                "last_clean.json",
            ]
        );

        let dest = TempDir::new().unwrap();
        export_files(storage.as_ref(), dest.path()).unwrap();
        assert_eq!(read_tree(source.path()), read_tree(dest.path()));
    }

    #[test]
    fn test_round_trip_keeps_top_level_locks_directory() {
        let source = TempDir::new().unwrap();
        fs::create_dir_all(source.path().join("locks")).unwrap();
        fs::write(source.path().join("locks/issue_cert_example.com.lock"), "{}").unwrap();
        fs::write(source.path().join("cert.pem"), "-----BEGIN CERTIFICATE-----").unwrap();

        let store_dir = TempDir::new().unwrap();
        let config = serde_json::to_vec(&serde_json::json!({
            "root": store_dir.path().join("store"),
        }))
        .unwrap();
        let storage = registry().init_storage("file", &config).unwrap();

        let imported = import_files(storage.as_ref(), source.path()).unwrap();
        let dest = TempDir::new().unwrap();
        let exported = export_files(storage.as_ref(), dest.path()).unwrap();

        assert_eq!(imported.files, 2);
        assert_eq!(imported, exported);
        assert_eq!(read_tree(source.path()), read_tree(dest.path()));

        storage.lock("issue_cert_example.com").unwrap();
        storage.unlock("issue_cert_example.com").unwrap();
        assert_eq!(storage.list("", true).unwrap().len(), 2);
    }

    #[test]
    fn test_exists_covers_keys_and_prefixes() {
        let store_dir = TempDir::new().unwrap();
        let config = serde_json::to_vec(&serde_json::json!({"root": store_dir.path()})).unwrap();
        let storage = registry().init_storage("file", &config).unwrap();
        storage.store("/certificates/example.com/example.com.crt", b"CERT").unwrap();

        assert!(storage.exists("/certificates/example.com/example.com.crt"));
        assert!(storage.exists("/certificates/example.com"));
        assert!(storage.exists("certificates"));
        assert!(!storage.exists("/certificates/other.com"));
        assert!(!storage.stat("certificates").unwrap().is_terminal);
    }

    #[test]
    fn test_file_storage_directly() {
        let temp_dir = TempDir::new().unwrap();
        let storage = FileStorage::new(temp_dir.path());
        storage.store("/acme/account.json", b"{}").unwrap();

        let info = storage.stat("acme/account.json").unwrap();
        assert_eq!(info.size, 2);
        assert!(info.is_terminal);
    }
}

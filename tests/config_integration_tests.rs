//! Integration tests for ConfigManager, MemoryRegistry and Settings
//!
//! These tests verify:
//! - Document loading and saving through the AppRegistry trait
//! - Protected exclusions surviving hand edits of the file
//! - Both registries behaving the same through the provided helpers
//! - Settings layering over the data directory

use camino::Utf8PathBuf;
use chromiumto::{
    AppDocument, AppRecord, AppRegistry, ConfigManager, ExclusionSet, MemoryRegistry, Settings,
};
use std::fs;
use tempfile::TempDir;

fn create_test_config_dir() -> (TempDir, Utf8PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let config_path = Utf8PathBuf::try_from(temp_dir.path().to_path_buf()).unwrap();
    (temp_dir, config_path)
}

// Drive the provided helpers identically against any registry.
fn exercise_registry(registry: &dyn AppRegistry) -> AppDocument {
    let slack = AppRecord::new("/apps/Slack", "120.0.6099.71", 1_000);
    let discord = AppRecord::new("/apps/Discord", "unknown", 2_000);

    registry.add_detected_app(&slack).unwrap();
    registry.add_detected_app(&discord).unwrap();
    registry
        .add_detected_app(&AppRecord::new("/apps/Slack", "121.0.0.1", 1_500))
        .unwrap();

    assert!(registry.add_redirected_app(&slack).unwrap());
    assert!(!registry.add_redirected_app(&slack).unwrap());

    registry
        .set_shared_kernel_path(Some(Utf8PathBuf::from("/data/SharedChrome")))
        .unwrap();
    registry
        .set_scan_exclusions(&ExclusionSet::from_patterns(["Games"]))
        .unwrap();

    registry.load().unwrap()
}

#[test]
fn test_create_config_manager() {
    let (_temp_dir, config_path) = create_test_config_dir();
    let manager = ConfigManager::new(&config_path).unwrap();

    assert_eq!(manager.config_dir(), &config_path);
    assert_eq!(manager.document_path(), config_path.join("config.yaml"));
}

#[test]
fn test_config_manager_creates_directory() {
    let (_temp_dir, config_path) = create_test_config_dir();
    let nested = config_path.join("a").join("b");

    ConfigManager::new(&nested).unwrap();
    assert!(nested.is_dir());
}

#[test]
fn test_registries_agree() {
    let (_temp_dir, config_path) = create_test_config_dir();
    let on_disk = exercise_registry(&ConfigManager::new(&config_path).unwrap());
    let in_memory = exercise_registry(&MemoryRegistry::new());

    for document in [&on_disk, &in_memory] {
        assert_eq!(document.detected_apps.len(), 2);
        assert_eq!(document.detected_apps[0].version, "121.0.0.1");
        assert_eq!(document.detected_apps[0].size, 1_500);
        assert_eq!(document.redirected_apps.len(), 1);
        assert_eq!(
            document.shared_kernel_path.as_deref(),
            Some(camino::Utf8Path::new("/data/SharedChrome"))
        );
        assert!(document.scan_exclusions.contains("Games"));
        assert!(document.scan_exclusions.contains("System Volume Information"));
    }
}

#[test]
fn test_document_survives_reopen() {
    let (_temp_dir, config_path) = create_test_config_dir();
    let saved = exercise_registry(&ConfigManager::new(&config_path).unwrap());

    let reopened = ConfigManager::new(&config_path).unwrap().load().unwrap();
    assert_eq!(reopened, saved);
    assert!(!config_path.join("config.yaml.tmp").exists());
}

#[test]
fn test_hand_edited_file_keeps_protected_exclusions() {
    let (_temp_dir, config_path) = create_test_config_dir();
    let manager = ConfigManager::new(&config_path).unwrap();

    fs::write(
        manager.document_path(),
        r#"shared_kernel_path: null
detected_apps: []
redirected_apps: []
scan_exclusions:
  - Steam
"#,
    )
    .unwrap();

    let document = manager.load().unwrap();
    let patterns: Vec<&str> = document.scan_exclusions.iter().collect();
    assert_eq!(patterns[0], "Steam");
    for protected in chromiumto::models::PROTECTED_EXCLUSIONS {
        assert!(document.scan_exclusions.contains(protected));
    }
}

#[test]
fn test_empty_file_loads_default() {
    let (_temp_dir, config_path) = create_test_config_dir();
    let manager = ConfigManager::new(&config_path).unwrap();
    fs::write(manager.document_path(), "\n").unwrap();

    assert_eq!(manager.load().unwrap(), AppDocument::default());
}

#[test]
fn test_clear_detected_apps_keeps_index() {
    let registry = MemoryRegistry::new();
    let app = AppRecord::new("/apps/Slack", "unknown", 0);
    registry.add_detected_app(&app).unwrap();
    registry.add_redirected_app(&app).unwrap();

    registry.clear_detected_apps().unwrap();

    let document = registry.load().unwrap();
    assert!(document.detected_apps.is_empty());
    assert!(document.is_indexed_redirected(&app.path));
}

#[test]
fn test_settings_from_data_dir() {
    let (_temp_dir, data_dir) = create_test_config_dir();
    fs::write(data_dir.join("settings.yaml"), "debug_mode: true\n").unwrap();

    let settings = Settings::load_from(&data_dir).unwrap();
    assert!(settings.debug_mode);
    assert_eq!(settings.log_dir, data_dir.join("logs"));

    let manager = settings.config_manager().unwrap();
    assert_eq!(manager.document_path(), data_dir.join("config.yaml"));
}

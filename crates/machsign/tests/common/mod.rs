//! Fixtures shared by the integration tests.

#![allow(dead_code)]

#[path = "../../src/macho/testutil.rs"]
pub mod macho;

#[path = "../../src/crypto/testutil.rs"]
pub mod crypto;

use std::fs;
use std::path::{Path, PathBuf};

pub fn write_info(bundle: &Path, identifier: &str, executable: &str) {
    let mut dict = plist::Dictionary::new();
    dict.insert(
        "CFBundleIdentifier".into(),
        plist::Value::String(identifier.into()),
    );
    dict.insert(
        "CFBundleExecutable".into(),
        plist::Value::String(executable.into()),
    );
    dict.insert("CFBundleVersion".into(), plist::Value::String("1".into()));
    plist::to_file_xml(bundle.join("Info.plist"), &plist::Value::Dictionary(dict)).unwrap();
}

/// `Demo.app` with a main executable, an embedded `Kit.framework` and a
/// resource file.
pub fn app_with_framework(dir: &Path) -> PathBuf {
    let app = dir.join("Demo.app");
    let framework = app.join("Frameworks/Kit.framework");
    fs::create_dir_all(&framework).unwrap();
    write_info(&app, "com.example.demo", "Demo");
    write_info(&framework, "com.example.kit", "Kit");
    fs::write(
        app.join("Demo"),
        macho::ThinImage::new()
            .with_dylib("@rpath/Kit.framework/Kit")
            .build(),
    )
    .unwrap();
    fs::write(framework.join("Kit"), macho::ThinImage::new().dylib().build()).unwrap();
    fs::write(app.join("Assets.car"), b"assets").unwrap();
    app
}

/// Every regular file under `dir` with its contents.
pub fn snapshot(dir: &Path) -> Vec<(PathBuf, Vec<u8>)> {
    let mut files: Vec<_> = walkdir::WalkDir::new(dir)
        .into_iter()
        .map(Result::unwrap)
        .filter(|e| e.file_type().is_file())
        .map(|e| (e.path().to_path_buf(), fs::read(e.path()).unwrap()))
        .collect();
    files.sort();
    files
}

// Apk inspection: pull the ABI-matching native libraries out of a payload apk

use crate::error::InjectError;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::info;
use zip::ZipArchive;

/// Native library directory inside an apk for an application abi tag,
/// e.g. "64-bit (arm64)" -> "arm64-v8a".
pub fn abi_dir_name(app_abi: &str) -> Result<&'static str, InjectError> {
    match app_abi {
        "64-bit (arm64)" => Ok("arm64-v8a"),
        "32-bit (arm32)" => Ok("armeabi-v7a"),
        "32-bit (x86)" => Ok("x86"),
        "64-bit (x86)" => Ok("x86_64"),
        _ => Err(InjectError::UnsupportedAbi(app_abi.to_string())),
    }
}

/// Abi tag for a device abi property, e.g. "arm64-v8a" -> "64-bit (arm64)".
pub fn abi_tag_for_device_abi(device_abi: &str) -> Option<&'static str> {
    match device_abi {
        "arm64-v8a" => Some("64-bit (arm64)"),
        "armeabi-v7a" | "armeabi" => Some("32-bit (arm32)"),
        "x86" => Some("32-bit (x86)"),
        "x86_64" => Some("64-bit (x86)"),
        _ => None,
    }
}

/// Extract every `lib/<abi dir>/*.so` entry of the apk into a fresh temp
/// directory. The returned `TempDir` owns the extracted files; keep it alive
/// until they are pushed.
pub fn extract_native_libraries(
    apk: &Path,
    app_abi: &str,
) -> Result<(TempDir, Vec<PathBuf>), InjectError> {
    let prefix = format!("lib/{}/", abi_dir_name(app_abi)?);

    let file = File::open(apk)?;
    let mut archive =
        ZipArchive::new(file).map_err(|e| InjectError::Io(io::Error::other(e)))?;

    let temp_dir = TempDir::with_prefix("artinjector-")?;
    let mut extracted = Vec::new();

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| InjectError::Io(io::Error::other(e)))?;
        let name = entry.name().to_string();
        if !name.starts_with(&prefix) || !name.ends_with(".so") {
            continue;
        }

        let file_name = name[prefix.len()..].to_string();
        let output_path = temp_dir.path().join(&file_name);
        let mut output = File::create(&output_path)?;
        io::copy(&mut entry, &mut output)?;

        info!("extracted library {} to {}", name, output_path.display());
        extracted.push(output_path);
    }

    Ok((temp_dir, extracted))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;
    use zip::CompressionMethod;

    #[test]
    fn test_abi_dir_name() {
        assert_eq!(abi_dir_name("64-bit (arm64)").unwrap(), "arm64-v8a");
        assert_eq!(abi_dir_name("32-bit (arm32)").unwrap(), "armeabi-v7a");
        assert_eq!(abi_dir_name("32-bit (x86)").unwrap(), "x86");
        assert_eq!(abi_dir_name("64-bit (x86)").unwrap(), "x86_64");
        assert!(matches!(
            abi_dir_name("mips"),
            Err(InjectError::UnsupportedAbi(_))
        ));
    }

    #[test]
    fn test_abi_tag_for_device_abi() {
        assert_eq!(abi_tag_for_device_abi("arm64-v8a"), Some("64-bit (arm64)"));
        assert_eq!(abi_tag_for_device_abi("armeabi"), Some("32-bit (arm32)"));
        assert_eq!(abi_tag_for_device_abi("riscv64"), None);
    }

    fn write_test_apk(path: &Path) {
        let file = File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options =
            SimpleFileOptions::default().compression_method(CompressionMethod::Stored);

        writer.start_file("classes.dex", options).unwrap();
        writer.write_all(b"dex").unwrap();
        writer
            .start_file("lib/arm64-v8a/libnative.so", options)
            .unwrap();
        writer.write_all(b"arm64 payload").unwrap();
        writer
            .start_file("lib/armeabi-v7a/libnative.so", options)
            .unwrap();
        writer.write_all(b"arm32 payload").unwrap();
        writer.finish().unwrap();
    }

    #[test]
    fn test_extract_only_matching_abi() {
        let dir = TempDir::new().unwrap();
        let apk = dir.path().join("payload.apk");
        write_test_apk(&apk);

        let (_keep, libs) = extract_native_libraries(&apk, "64-bit (arm64)").unwrap();
        assert_eq!(libs.len(), 1);
        assert_eq!(libs[0].file_name().unwrap(), "libnative.so");
        assert_eq!(std::fs::read(&libs[0]).unwrap(), b"arm64 payload");
    }

    #[test]
    fn test_extract_no_matching_abi() {
        let dir = TempDir::new().unwrap();
        let apk = dir.path().join("payload.apk");
        write_test_apk(&apk);

        let (_keep, libs) = extract_native_libraries(&apk, "32-bit (x86)").unwrap();
        assert!(libs.is_empty());
    }
}

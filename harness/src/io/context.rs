//! Image build context bundling.
//!
//! The context is an uncompressed tar holding the rendered `Dockerfile`, the
//! source tree under `<repo_dir>/`, and auxiliary files at the root.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tar::{Builder, EntryType, Header, HeaderMode};
use walkdir::WalkDir;

/// Inputs for one build context.
#[derive(Debug, Clone)]
pub struct BuildContext<'a> {
    pub dockerfile: &'a str,
    /// Local checkout copied into the image.
    pub source: &'a Path,
    /// Directory name of the checkout inside the context.
    pub repo_dir: &'a str,
    /// Files added at the context root by file name (e.g. CA certificates).
    pub aux_files: &'a [PathBuf],
}

fn append_bytes(builder: &mut Builder<&mut Vec<u8>>, name: &str, bytes: &[u8]) -> Result<()> {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_cksum();
    builder
        .append_data(&mut header, name, bytes)
        .with_context(|| format!("append tar entry {name}"))
}

/// Build the tar bytes for an image build.
pub fn bundle(ctx: &BuildContext<'_>) -> Result<Vec<u8>> {
    if !ctx.source.is_dir() {
        bail!("source tree {} is not a directory", ctx.source.display());
    }
    let mut buf = Vec::new();
    {
        let mut builder = Builder::new(&mut buf);
        builder.mode(HeaderMode::Deterministic);
        builder.follow_symlinks(false);

        append_bytes(&mut builder, "Dockerfile", ctx.dockerfile.as_bytes())?;

        for entry in WalkDir::new(ctx.source).sort_by_file_name() {
            let entry = entry.with_context(|| format!("walk {}", ctx.source.display()))?;
            let rel = entry
                .path()
                .strip_prefix(ctx.source)
                .with_context(|| format!("relativize {}", entry.path().display()))?;
            let name = Path::new(ctx.repo_dir).join(rel);
            builder
                .append_path_with_name(entry.path(), &name)
                .with_context(|| format!("append {}", entry.path().display()))?;
        }

        for file in ctx.aux_files {
            let name = file
                .file_name()
                .with_context(|| format!("auxiliary file without a name {}", file.display()))?;
            if !file.is_file() {
                bail!("auxiliary file '{}' not found", file.display());
            }
            builder
                .append_path_with_name(file, name)
                .with_context(|| format!("append {}", file.display()))?;
        }

        builder.finish().context("finish tar")?;
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::io::Read;

    use super::*;

    fn entries(bytes: &[u8]) -> Vec<(String, String)> {
        let mut archive = tar::Archive::new(bytes);
        let mut out = Vec::new();
        for entry in archive.entries().expect("entries") {
            let mut entry = entry.expect("entry");
            let path = entry.path().expect("path").display().to_string();
            let mut contents = String::new();
            if entry.header().entry_type().is_file() {
                entry.read_to_string(&mut contents).expect("read");
            }
            out.push((path, contents));
        }
        out
    }

    #[test]
    fn bundles_dockerfile_source_and_aux_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let source = temp.path().join("owner__proj");
        fs::create_dir_all(source.join("pkg")).expect("mkdir");
        fs::write(source.join("pkg").join("mod.py"), "x = 1\n").expect("write");
        let cert = temp.path().join("corp.crt");
        fs::write(&cert, "CERT").expect("write cert");

        let bytes = bundle(&BuildContext {
            dockerfile: "FROM scratch\n",
            source: &source,
            repo_dir: "owner__proj",
            aux_files: &[cert],
        })
        .expect("bundle");
        let entries = entries(&bytes);

        assert_eq!(entries[0], ("Dockerfile".to_string(), "FROM scratch\n".to_string()));
        assert!(entries.contains(&("owner__proj/pkg/mod.py".to_string(), "x = 1\n".to_string())));
        assert!(entries.contains(&("corp.crt".to_string(), "CERT".to_string())));
    }

    #[test]
    fn missing_aux_file_fails() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = bundle(&BuildContext {
            dockerfile: "FROM scratch\n",
            source: temp.path(),
            repo_dir: "repo",
            aux_files: &[temp.path().join("absent.crt")],
        })
        .expect_err("missing");
        assert!(err.to_string().contains("absent.crt"));
    }

    #[test]
    fn bundling_is_deterministic() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("a.py"), "a").expect("write");
        fs::write(temp.path().join("b.py"), "b").expect("write");
        let ctx = BuildContext {
            dockerfile: "FROM scratch\n",
            source: temp.path(),
            repo_dir: "repo",
            aux_files: &[],
        };
        assert_eq!(bundle(&ctx).expect("first"), bundle(&ctx).expect("second"));
    }
}

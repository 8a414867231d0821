use std::path::{Path, PathBuf};

use crate::error::{Error, IoContext, Result};
use crate::server_config::parse_memory;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchKind {
    Jar,
    ArgsFile,
}

#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub exec: String,
    pub args: Vec<String>,
    pub kind: LaunchKind,
}

impl LaunchSpec {
    pub fn display(&self) -> String {
        format!("{} {}", self.exec, self.args.join(" "))
    }
}

fn heap_flags(memory: &str) -> [String; 2] {
    [format!("-Xmx{memory}"), format!("-Xms{memory}")]
}

fn write_heap_args_file(server_dir: &Path, memory: &str) -> Result<PathBuf> {
    let path = server_dir.join("craft_jvm_args.txt");
    let tmp = server_dir.join("craft_jvm_args.txt.tmp");
    let [xmx, xms] = heap_flags(memory);
    std::fs::write(&tmp, format!("{xmx}\n{xms}\n"))
        .io_context(|| format!("write {}", tmp.display()))?;
    std::fs::rename(&tmp, &path).io_context(|| format!("persist {}", path.display()))?;
    Ok(path)
}

fn collect_named_files(root: &Path, file_name: &str, out: &mut Vec<PathBuf>) {
    let rd = match std::fs::read_dir(root) {
        Ok(v) => v,
        Err(_) => return,
    };
    for e in rd.flatten() {
        let path = e.path();
        let meta = match std::fs::symlink_metadata(&path) {
            Ok(m) => m,
            Err(_) => continue,
        };
        if meta.file_type().is_symlink() {
            continue;
        }
        if meta.is_dir() {
            collect_named_files(&path, file_name, out);
            continue;
        }
        if meta.is_file() && path.file_name().and_then(|s| s.to_str()) == Some(file_name) {
            out.push(path);
        }
    }
}

/// Shallowest match wins; ties break lexically so the choice is stable.
fn shallowest(mut candidates: Vec<PathBuf>) -> Option<PathBuf> {
    candidates.sort_by(|a, b| {
        a.components()
            .count()
            .cmp(&b.components().count())
            .then_with(|| a.cmp(b))
    });
    candidates.into_iter().next()
}

fn find_unix_args(server_dir: &Path) -> Option<PathBuf> {
    // Forge/NeoForge installers place the launch args under libraries/**/unix_args.txt.
    let mut out = Vec::<PathBuf>::new();
    let libs = server_dir.join("libraries");
    if libs.is_dir() {
        collect_named_files(&libs, "unix_args.txt", &mut out);
    }
    shallowest(out)
}

fn to_rel_str(base: &Path, path: &Path) -> Result<String> {
    let rel = path
        .strip_prefix(base)
        .map_err(|_| Error::InvalidArgument(format!("{} is outside the server dir", path.display())))?;
    Ok(rel.to_string_lossy().to_string())
}

/// Work out how to launch whatever is installed in `server_dir`.
///
/// A plain `server.jar` wins. Otherwise a modded server pack is launched via
/// its `unix_args.txt`, with heap bounds passed through a generated args file
/// so they stay under agent control.
pub fn resolve_launch_spec(server_dir: &Path, java_bin: &str, memory: &str) -> Result<LaunchSpec> {
    let memory = parse_memory(memory)?;

    if server_dir.join("server.jar").is_file() {
        let [xmx, xms] = heap_flags(&memory);
        return Ok(LaunchSpec {
            exec: java_bin.to_string(),
            args: vec![
                xmx,
                xms,
                "-jar".to_string(),
                "server.jar".to_string(),
                "nogui".to_string(),
            ],
            kind: LaunchKind::Jar,
        });
    }

    if let Some(unix_args) = find_unix_args(server_dir) {
        let heap_args = write_heap_args_file(server_dir, &memory)?;
        let mut args = Vec::<String>::new();
        let user_jvm = server_dir.join("user_jvm_args.txt");
        if user_jvm.is_file() {
            args.push(format!("@{}", to_rel_str(server_dir, &user_jvm)?));
        }
        args.push(format!("@{}", to_rel_str(server_dir, &heap_args)?));
        args.push(format!("@{}", to_rel_str(server_dir, &unix_args)?));
        args.push("nogui".to_string());

        return Ok(LaunchSpec {
            exec: java_bin.to_string(),
            args,
            kind: LaunchKind::ArgsFile,
        });
    }

    Err(Error::DownstreamUnavailable(format!(
        "nothing to launch in {} (expected server.jar or libraries/**/unix_args.txt)",
        server_dir.display()
    )))
}

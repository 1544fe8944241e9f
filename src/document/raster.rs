use anyhow::{Context, Result, anyhow};
use image::RgbImage;
use std::env;
use std::fs;
use std::path::Path;
use std::process::Command;
use tempfile::tempdir;

/// Renders one page (1-based) of `pdf_bytes` at `zoom` pixels per point.
///
/// Uses `mutool` when installed, else `pdftoppm`.
pub fn render_pdf_page(pdf_bytes: &[u8], page: usize, zoom: f32) -> Result<RgbImage> {
    let dpi = (72.0 * zoom).round().max(1.0) as u32;
    let dir = tempdir().with_context(|| "failed to create temp dir for page render")?;
    let input_path = dir.path().join("input.pdf");
    fs::write(&input_path, pdf_bytes).with_context(|| "failed to write temp pdf")?;
    let output_path = dir.path().join("page.png");

    if command_exists("mutool") {
        let mut command = Command::new("mutool");
        command
            .arg("draw")
            .arg("-q")
            .arg("-r")
            .arg(dpi.to_string())
            .arg("-o")
            .arg(&output_path)
            .arg(&input_path)
            .arg(page.to_string());
        run(&mut command, "mutool")?;
    } else if command_exists("pdftoppm") {
        let mut command = Command::new("pdftoppm");
        command
            .arg("-png")
            .arg("-r")
            .arg(dpi.to_string())
            .arg("-f")
            .arg(page.to_string())
            .arg("-l")
            .arg(page.to_string())
            .arg("-singlefile")
            .arg(&input_path)
            .arg(dir.path().join("page"));
        run(&mut command, "pdftoppm")?;
    } else {
        return Err(anyhow!(
            "page rendering requires mutool or pdftoppm to be installed"
        ));
    }

    let image = image::open(&output_path)
        .with_context(|| format!("failed to read rendered page {page}"))?;
    Ok(image.to_rgb8())
}

fn run(command: &mut Command, label: &str) -> Result<()> {
    let output = command
        .output()
        .with_context(|| format!("failed to run {label}"))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow!("{label} failed: {}", stderr.trim()));
    }
    Ok(())
}

pub(crate) fn command_exists(cmd: &str) -> bool {
    let path = Path::new(cmd);
    if path.components().count() > 1 {
        return is_executable(path);
    }

    let Some(path_var) = env::var_os("PATH") else {
        return false;
    };

    #[cfg(windows)]
    let candidates = windows_command_candidates(cmd);
    #[cfg(not(windows))]
    let candidates = vec![cmd.to_string()];

    env::split_paths(&path_var).any(|dir| {
        candidates
            .iter()
            .any(|candidate| is_executable(&dir.join(candidate)))
    })
}

fn is_executable(path: &Path) -> bool {
    let Ok(metadata) = fs::metadata(path) else {
        return false;
    };
    if !metadata.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

#[cfg(windows)]
fn windows_command_candidates(cmd: &str) -> Vec<String> {
    if Path::new(cmd).extension().is_some() {
        return vec![cmd.to_string()];
    }
    let pathext = env::var_os("PATHEXT").unwrap_or_else(|| ".EXE;.CMD;.BAT;.COM".into());
    pathext
        .to_string_lossy()
        .split(';')
        .filter(|ext| !ext.is_empty())
        .map(|ext| format!("{cmd}{}", ext.to_ascii_lowercase()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_commands_are_not_found() {
        assert!(!command_exists("layout-translator-no-such-tool"));
        assert!(!command_exists("/definitely/not/here/mutool"));
    }

    #[cfg(unix)]
    #[test]
    fn executable_bit_is_required() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let tool = dir.path().join("tool");
        fs::write(&tool, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&tool, fs::Permissions::from_mode(0o644)).unwrap();
        assert!(!command_exists(tool.to_str().unwrap()));
        fs::set_permissions(&tool, fs::Permissions::from_mode(0o755)).unwrap();
        assert!(command_exists(tool.to_str().unwrap()));
    }
}

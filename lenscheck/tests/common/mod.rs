use assert_cmd::cargo::cargo_bin_cmd;
use assert_cmd::Command;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub const REAL: &str = r#"{"prediction":"Real","confidence":0.93,"real_prob":0.93,"fake_prob":0.07,"flag_review":false,"model_votes":{"resnet34":"Real","efficientnet_b0":"Real"}}"#;
pub const FAKE: &str = r#"{"prediction":"AI/Fake","confidence":0.88,"real_prob":0.12,"fake_prob":0.88,"flag_review":false,"model_votes":{"resnet34":"AI/Fake","efficientnet_b0":"AI/Fake"}}"#;

pub struct TestEnv {
    _tmp: TempDir,
    pub dir: PathBuf,
    pub predictor: PathBuf,
}

impl TestEnv {
    /// Stub ensemble: images whose path contains "fake" are AI/Fake, those
    /// containing "broken" get an error reply, the rest Real.
    pub fn new() -> Self {
        Self::with_predictor(&serving_predictor(""))
    }

    pub fn with_predictor(script: &str) -> Self {
        let tmp = TempDir::new().expect("create temp dir");
        let dir = tmp.path().to_path_buf();
        let predictor = dir.join("predict.sh");
        fs::write(&predictor, script).expect("write predictor");
        make_executable(&predictor);
        Self { _tmp: tmp, dir, predictor }
    }

    pub fn cmd(&self) -> Command {
        let mut cmd = cargo_bin_cmd!("lenscheck");
        cmd.arg("--predictor").arg(&self.predictor).env("RUST_LOG", "lenscheck=warn");
        cmd
    }

    /// A smooth gradient PNG, written under the test dir.
    pub fn png(&self, name: &str) -> String {
        let img = image::RgbImage::from_fn(64, 64, |x, y| image::Rgb([(x * 4) as u8, (y * 4) as u8, 120]));
        let path = self.dir.join(name);
        img.save(&path).expect("write png");
        path.to_str().expect("path utf8").to_string()
    }

    pub fn file(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.dir.join(name);
        fs::write(&path, contents).expect("write file");
        path
    }
}

/// A long-lived predictor script. `setup` runs before the ready line.
pub fn serving_predictor(setup: &str) -> String {
    format!(
        "#!/bin/sh\n{setup}\
         echo 'loading weights'\n\
         echo '{{\"status\":\"ready\"}}'\n\
         while IFS= read -r line; do\n\
           case \"$line\" in\n\
             *fake*) echo '{FAKE}' ;;\n\
             *broken*) echo '{{\"error\":\"model crashed\"}}' ;;\n\
             *) echo '{REAL}' ;;\n\
           esac\n\
         done\n"
    )
}

pub fn request(id: &str, path: &str) -> String {
    serde_json::json!({ "id": id, "image_path": path }).to_string()
}

/// Every stdout line as JSON; the first is the readiness record.
pub fn records(stdout: &[u8]) -> Vec<Value> {
    String::from_utf8(stdout.to_vec())
        .expect("stdout utf8")
        .lines()
        .map(|l| serde_json::from_str(l).expect("stdout line is json"))
        .collect()
}

#[cfg(unix)]
pub fn make_executable(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).expect("chmod predictor");
}

#[cfg(not(unix))]
pub fn make_executable(_: &Path) {}

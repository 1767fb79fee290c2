//! SGLang server launched as `python3 -m sglang.launch_server`

use crate::config::BackendConfig;
use crate::supervisor::LaunchSpec;

/// Flags that put SGLang into batch-invariant, reproducible mode
const DETERMINISTIC_ARGS: &[&str] = &[
    "--attention-backend",
    "fa3",
    "--enable-deterministic-inference",
    "--context-length",
    "32768",
];

pub fn launch_spec(config: &BackendConfig) -> LaunchSpec {
    let mut spec = LaunchSpec::new("sglang", config.python.as_str())
        .args(["-m", "sglang.launch_server", "--model-path"])
        .arg(config.model_path.to_string_lossy())
        .arg("--host")
        .arg(config.host.as_str())
        .arg("--port")
        .arg(config.port.to_string())
        .args(DETERMINISTIC_ARGS.iter().copied())
        .args(config.extra_args.iter().cloned())
        .envs(&config.env);
    spec.work_dir = config.work_dir.clone();
    spec
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendKind;
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use std::time::Duration;

    #[test]
    fn test_launch_spec() {
        let config = BackendConfig {
            kind: BackendKind::Sglang,
            model_path: PathBuf::from("/models/qwen"),
            host: "127.0.0.1".to_string(),
            port: 30000,
            python: "python3".to_string(),
            extra_args: vec!["--tp-size".to_string(), "2".to_string()],
            env: BTreeMap::from([("CUDA_VISIBLE_DEVICES".to_string(), "0,1".to_string())]),
            work_dir: None,
            startup_timeout: Duration::from_secs(300),
            health_check_interval: Duration::from_secs(2),
            health_check_timeout: Duration::from_secs(5),
            max_consecutive_failures: 3,
        };

        let spec = launch_spec(&config);
        assert_eq!(spec.label, "sglang");
        assert_eq!(spec.program, "python3");
        assert_eq!(
            spec.command_line(),
            "python3 -m sglang.launch_server --model-path /models/qwen --host 127.0.0.1 \
             --port 30000 --attention-backend fa3 --enable-deterministic-inference \
             --context-length 32768 --tp-size 2"
        );
        assert_eq!(spec.env.get("CUDA_VISIBLE_DEVICES").map(String::as_str), Some("0,1"));
    }
}

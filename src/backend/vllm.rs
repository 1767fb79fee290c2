//! vLLM's OpenAI-compatible API server

use crate::config::BackendConfig;
use crate::supervisor::LaunchSpec;

pub fn launch_spec(config: &BackendConfig) -> LaunchSpec {
    let mut spec = LaunchSpec::new("vllm", config.python.as_str())
        .args(["-m", "vllm.entrypoints.openai.api_server", "--model"])
        .arg(config.model_path.to_string_lossy())
        .arg("--host")
        .arg(config.host.as_str())
        .arg("--port")
        .arg(config.port.to_string())
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
            kind: BackendKind::Vllm,
            model_path: PathBuf::from("/models/mistral"),
            host: "0.0.0.0".to_string(),
            port: 8001,
            python: "/opt/venv/bin/python".to_string(),
            extra_args: Vec::new(),
            env: BTreeMap::new(),
            work_dir: Some(PathBuf::from("/srv")),
            startup_timeout: Duration::from_secs(60),
            health_check_interval: Duration::from_secs(1),
            health_check_timeout: Duration::from_secs(1),
            max_consecutive_failures: 3,
        };

        let spec = launch_spec(&config);
        assert_eq!(spec.label, "vllm");
        assert_eq!(
            spec.command_line(),
            "/opt/venv/bin/python -m vllm.entrypoints.openai.api_server --model /models/mistral \
             --host 0.0.0.0 --port 8001"
        );
        assert_eq!(spec.work_dir, Some(PathBuf::from("/srv")));
    }
}

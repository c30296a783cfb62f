use logship_core::config::OutputConfig;
use logship_core::{Output, ShipError};
use logship_output::{FileOutput, LumberjackOutput, ScreenOutput, SocketOutput};

/// An output adapter together with its normalized routing keys.
pub struct BuiltOutput {
    pub keys: Vec<String>,
    pub adapter: Box<dyn Output>,
}

impl BuiltOutput {
    /// Whether this output accepts events of `event_type`. `*` matches any.
    pub fn accepts(&self, event_type: &str) -> bool {
        self.keys.iter().any(|k| k == "*" || k == event_type)
    }
}

/// Instantiate one output adapter from its validated configuration.
/// Unknown kinds were already rejected when the config was parsed.
pub fn build_output(config: &OutputConfig) -> Result<BuiltOutput, ShipError> {
    let keys = config.routing_keys();
    let adapter: Box<dyn Output> = match config {
        OutputConfig::Lumberjack(c) => Box::new(LumberjackOutput::new(c)?),
        OutputConfig::Socket(c) => Box::new(SocketOutput::new(c)),
        OutputConfig::Screen(c) => Box::new(ScreenOutput::new(c)),
        OutputConfig::File(c) => Box::new(FileOutput::new(c)),
    };
    Ok(BuiltOutput { keys, adapter })
}

pub fn build_outputs(configs: &[OutputConfig]) -> Result<Vec<BuiltOutput>, ShipError> {
    configs.iter().map(build_output).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routing_match() {
        let toml = r#"
[[input]]
input = "file"
type = "app"
path = "/f"

[[output]]
output = "screen"
type = "app,web"

[[output]]
output = "screen"
type = "*"
"#;
        let config = logship_core::Config::from_str(toml).unwrap();
        let outputs = build_outputs(&config.outputs).unwrap();

        assert!(outputs[0].accepts("app"));
        assert!(outputs[0].accepts("web"));
        assert!(!outputs[0].accepts("db"));
        assert!(outputs[1].accepts("db"));
    }
}

//! Process configuration read from the environment.

#[derive(Debug, Clone)]
pub struct Config {
    /// `host:port` of the runtime control endpoint.
    pub runtime_api: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let runtime_api = std::env::var("AWS_LAMBDA_RUNTIME_API")
            .map_err(|_| anyhow::anyhow!("missing AWS_LAMBDA_RUNTIME_API"))?;

        Ok(Self { runtime_api })
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.runtime_api)
    }
}

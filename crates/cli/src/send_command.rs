use std::path::{Path, PathBuf};

use {
    anyhow::{Context, bail},
    clap::Args,
    flowline_config::TransportConfig,
    flowline_devices::{DeviceManager, Headers, Message, MessageBundle},
    serde_json::Value,
    tokio::io::AsyncReadExt,
    tracing::info,
};

use crate::wiring;

#[derive(Args)]
pub struct SendArgs {
    /// Output device to send to.
    #[arg(long)]
    device: String,

    /// Message header as `key=value`. Values that parse as JSON are sent as
    /// JSON, anything else as a string. Repeatable.
    #[arg(long = "header", value_name = "KEY=VALUE")]
    headers: Vec<String>,

    /// Read the payload from this file.
    #[arg(long, conflicts_with = "payload")]
    file: Option<PathBuf>,

    /// Payload text. Read from stdin when neither this nor `--file` is given.
    payload: Option<String>,
}

pub async fn send(config_path: Option<&Path>, args: SendArgs) -> anyhow::Result<()> {
    let config = flowline_config::load_or_default(config_path)?.config;
    if matches!(config.transport, TransportConfig::Memory) {
        bail!("`send` needs a shared transport; memory queues only live inside one process");
    }

    let headers = parse_headers(&args.headers)?;
    let data = match (&args.payload, &args.file) {
        (Some(text), _) => text.clone().into_bytes(),
        (None, Some(path)) => tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?,
        (None, None) => {
            let mut buf = Vec::new();
            tokio::io::stdin().read_to_end(&mut buf).await?;
            buf
        },
    };

    let managers = wiring::build_managers(&config)?;
    let mut devices = DeviceManager::new().with_output_manager(managers.output);
    devices.connect().await?;
    let result = async {
        let device = devices.get_output_device(&args.device).await?;
        let len = data.len();
        device
            .send_message(&MessageBundle::new(Message::with_headers_map(data, headers)))
            .await?;
        info!(device = %args.device, bytes = len, "message sent");
        anyhow::Ok(())
    }
    .await;
    let closed = devices.close_all().await;
    result?;
    closed?;
    Ok(())
}

fn parse_headers(raw: &[String]) -> anyhow::Result<Headers> {
    let mut headers = Headers::new();
    for entry in raw {
        let Some((key, value)) = entry.split_once('=') else {
            bail!("invalid header '{entry}', expected KEY=VALUE");
        };
        if key.is_empty() {
            bail!("invalid header '{entry}', empty key");
        }
        let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.into()));
        headers.insert(key.to_string(), value);
    }
    Ok(headers)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {super::*, rstest::rstest, serde_json::json};

    #[rstest]
    #[case("id=42", "id", json!(42))]
    #[case("name=orders", "name", json!("orders"))]
    #[case("flag=true", "flag", json!(true))]
    #[case("expr=a=b", "expr", json!("a=b"))]
    #[case("empty=", "empty", json!(""))]
    fn headers_parse_json_or_string(#[case] raw: &str, #[case] key: &str, #[case] expected: Value) {
        let headers = parse_headers(&[raw.to_string()]).unwrap();
        assert_eq!(headers.get(key), Some(&expected));
    }

    #[rstest]
    #[case("novalue")]
    #[case("=x")]
    fn malformed_headers_are_rejected(#[case] raw: &str) {
        assert!(parse_headers(&[raw.to_string()]).is_err());
    }
}

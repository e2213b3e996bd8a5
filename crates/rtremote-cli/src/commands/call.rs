//! `rtremote call`: one request, one reply

use anyhow::{bail, Context};
use rtremote::{Document, Endpoint, Environment, RemoteConfig};
use serde_json::Value;

pub struct CallArgs {
    pub connect: String,
    pub message_type: String,
    pub body: Option<String>,
    pub timeout_ms: u64,
}

pub fn execute(config: RemoteConfig, args: CallArgs) -> anyhow::Result<()> {
    let endpoint: Endpoint = args.connect.parse()?;
    let request = build_request(&args.message_type, args.body.as_deref())?;

    let env = Environment::new(config)?;
    let stream = env
        .connect(&endpoint)
        .with_context(|| format!("connecting to {}", endpoint))?;

    let mut handle = stream.send_with_wait(&request)?;
    let outcome = handle.wait(args.timeout_ms);
    let reply = handle.response();
    drop(handle);
    stream.close()?;
    env.shutdown();

    outcome.with_context(|| format!("waiting for reply to {}", args.message_type))?;
    match reply {
        Some(reply) => println!("{}", serde_json::to_string_pretty(reply.value())?),
        None => bail!("request completed without a reply"),
    }
    Ok(())
}

fn build_request(message_type: &str, body: Option<&str>) -> anyhow::Result<Document> {
    let mut value = match body {
        Some(body) => serde_json::from_str::<Value>(body).context("parsing --body")?,
        None => Value::Object(Default::default()),
    };
    let fields = match value.as_object_mut() {
        Some(fields) => fields,
        None => bail!("--body must be a JSON object"),
    };
    fields.insert(
        rtremote::document::MESSAGE_TYPE_FIELD.to_string(),
        Value::String(message_type.to_string()),
    );
    Ok(Document::new(value))
}

use std::io::Write;

use {
    anyhow::{Context, Result, bail},
    chatrelay_agents::ChatOption,
    futures::StreamExt,
    serde_json::Value,
};

/// Parse `name`, `name=true` or `name=false` into an option switch.
pub fn parse_option(raw: &str) -> Result<ChatOption, String> {
    let (name, enabled) = match raw.split_once('=') {
        Some((name, value)) => {
            let enabled = value
                .parse::<bool>()
                .map_err(|_| format!("expected true or false after '=', got {value:?}"))?;
            (name, enabled)
        },
        None => (raw, true),
    };
    let name = name.trim();
    if name.is_empty() {
        return Err("option name must not be empty".into());
    }
    Ok(ChatOption {
        name: name.to_string(),
        enabled,
    })
}

/// Submit a query, then print the streamed reply as it arrives.
pub async fn chat(url: &str, query: &str, session: &str, options: Vec<ChatOption>) -> Result<()> {
    let client = reqwest::Client::new();
    let body = serde_json::json!({
        "query": query,
        "session_id": session,
        "options": options,
    });

    let resp = client
        .post(format!("{url}/api/chat"))
        .json(&body)
        .send()
        .await
        .with_context(|| format!("could not reach {url}"))?;
    if !resp.status().is_success() {
        let status = resp.status();
        let body: Value = resp.json().await.unwrap_or_default();
        bail!(
            "submit failed ({status}): {}",
            body["error"].as_str().unwrap_or("unknown error")
        );
    }

    let resp = client
        .get(format!("{url}/api/stream/{session}"))
        .send()
        .await?
        .error_for_status()?;

    let mut bytes = resp.bytes_stream();
    let mut buf: Vec<u8> = Vec::new();
    let mut stdout = std::io::stdout();
    while let Some(chunk) = bytes.next().await {
        buf.extend_from_slice(&chunk?);
        while let Some(frame) = take_frame(&mut buf) {
            let Some(event) = parse_frame(&frame) else {
                continue;
            };
            let content = event["content"].as_str().unwrap_or_default();
            match event["type"].as_str() {
                Some("stream") => {
                    print!("{content}");
                    stdout.flush()?;
                },
                Some("complete") => {
                    println!();
                    println!("── answer ──");
                    println!("{content}");
                    return Ok(());
                },
                Some("error") => {
                    println!();
                    bail!("relay error: {content}");
                },
                _ => {},
            }
        }
    }
    bail!("stream closed before a final answer")
}

/// Split the next complete `\n\n`-terminated SSE frame off `buf`.
///
/// Frames are decoded only once complete, so characters split across
/// network chunks survive.
fn take_frame(buf: &mut Vec<u8>) -> Option<String> {
    let pos = buf.windows(2).position(|w| w == b"\n\n")?;
    let frame: Vec<u8> = buf.drain(..pos + 2).collect();
    Some(String::from_utf8_lossy(&frame).into_owned())
}

fn parse_frame(frame: &str) -> Option<Value> {
    let data = frame
        .lines()
        .find_map(|line| line.strip_prefix("data:"))?;
    serde_json::from_str(data.trim_start()).ok()
}

pub async fn history(url: &str, session: &str) -> Result<()> {
    let body: Value = reqwest::get(format!("{url}/api/history/{session}"))
        .await?
        .error_for_status()?
        .json()
        .await?;
    let messages = body["history"].as_array().cloned().unwrap_or_default();
    if messages.is_empty() {
        println!("no history for session {session}");
    }
    for message in messages {
        println!(
            "{:>9}: {}",
            message["role"].as_str().unwrap_or("?"),
            message["content"].as_str().unwrap_or_default()
        );
    }
    Ok(())
}

pub async fn clear(url: &str, session: &str) -> Result<()> {
    let body: Value = reqwest::Client::new()
        .post(format!("{url}/api/clear/{session}"))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    println!("{}", body["message"].as_str().unwrap_or("History cleared"));
    Ok(())
}

pub async fn health(url: &str) -> Result<()> {
    let body: Value = reqwest::get(format!("{url}/api/health"))
        .await
        .with_context(|| format!("could not reach {url}"))?
        .error_for_status()?
        .json()
        .await?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn option_forms() {
        assert_eq!(parse_option("memory").unwrap(), ChatOption {
            name: "memory".into(),
            enabled: true,
        });
        assert_eq!(parse_option("blender=false").unwrap(), ChatOption {
            name: "blender".into(),
            enabled: false,
        });
        assert!(parse_option("blender=maybe").is_err());
        assert!(parse_option("=true").is_err());
    }

    #[test]
    fn frame_parsing() {
        let event = parse_frame("data: {\"type\":\"stream\",\"content\":\"Hi\"}\n\n").unwrap();
        assert_eq!(event["content"], "Hi");
        assert!(parse_frame(": keep-alive\n\n").is_none());
    }

    #[test]
    fn frame_split_inside_a_character() {
        let wire = "data: {\"type\":\"stream\",\"content\":\"你好\"}\n\ndata: {\"type\"".as_bytes();
        let cut = wire.iter().position(|&b| b >= 0x80).unwrap() + 2;

        let mut buf = wire[..cut].to_vec();
        assert!(take_frame(&mut buf).is_none());
        buf.extend_from_slice(&wire[cut..]);

        let frame = take_frame(&mut buf).unwrap();
        let event = parse_frame(&frame).unwrap();
        assert_eq!(event["content"], "你好");
        assert_eq!(buf, b"data: {\"type\"");
        assert!(take_frame(&mut buf).is_none());
    }
}

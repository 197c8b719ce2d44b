//! Test fixture, not part of the broker's public API.
//!
//! A minimal RPC child used only by `tests/*.rs`: announces
//! `subprocess_ready`, then echoes every Request it receives back as a
//! Response with the same payload. Stands in for the "individual child
//! process business logic" the broker treats as a black-box external
//! collaborator. `BROKER_CHILD_MUTE=1` makes it swallow every request
//! silently, used to simulate an unresponsive child.

use procbroker::message::{Message, MessageType};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let mode = args.get(1).map(String::as_str).unwrap_or("pipe");
    let child_id = std::env::var("BROKER_CHILD_ID").unwrap_or_else(|_| "child".to_string());

    match mode {
        "uds" => {
            let path = args.get(2).expect("uds mode requires a socket path");
            let stream = tokio::net::UnixStream::connect(path).await.expect("connect to broker socket");
            let (read_half, write_half) = stream.into_split();
            run(BufReader::new(read_half), write_half, &child_id).await;
        }
        _ => {
            use std::os::unix::io::FromRawFd;
            let read_file = unsafe { std::fs::File::from_raw_fd(3) };
            let write_file = unsafe { std::fs::File::from_raw_fd(4) };
            let reader = tokio::fs::File::from_std(read_file);
            let writer = tokio::fs::File::from_std(write_file);
            run(BufReader::new(reader), writer, &child_id).await;
        }
    }
}

async fn run<R, W>(mut reader: BufReader<R>, mut writer: W, child_id: &str)
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut ready = Message::event("subprocess_ready", serde_json::json!({}));
    ready.source = child_id.to_string();
    write_message(&mut writer, &ready).await;

    let mute = std::env::var("BROKER_CHILD_MUTE").ok().as_deref() == Some("1");

    loop {
        let Some(message) = read_message(&mut reader).await else {
            break;
        };
        if mute || message.kind != MessageType::Request {
            continue;
        }
        let mut response = Message::response(message.id.clone(), message.payload.clone());
        response.source = child_id.to_string();
        response.target = message.source.clone();
        response.correlation_id = message.correlation_id.clone();
        write_message(&mut writer, &response).await;
    }
}

async fn write_message<W: tokio::io::AsyncWrite + Unpin>(writer: &mut W, message: &Message) {
    let frame = message.encode().expect("encode message");
    writer.write_all(&frame).await.expect("write message");
}

async fn read_message<R: tokio::io::AsyncRead + Unpin>(reader: &mut BufReader<R>) -> Option<Message> {
    let mut line = Vec::new();
    let n = reader.read_until(b'\n', &mut line).await.ok()?;
    if n == 0 {
        return None;
    }
    if line.last() == Some(&b'\n') {
        line.pop();
    }
    Message::decode(&line).ok()
}

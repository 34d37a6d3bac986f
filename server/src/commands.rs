//! Subcommand dispatch for the `pawpaint-view` binary.

use anyhow::{Context, Result};
use std::{path::Path, sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use view_api::{normalize, RoomCode, Snapshot};

use crate::{
    api,
    client::{image_data_uri, HttpTransport},
    clock::SystemClock,
    config::{Command, Config},
    live::{Viewer, ViewerSettings},
};

pub async fn run(command: Option<Command>, config: Config) -> Result<()> {
    match command.unwrap_or(Command::Serve) {
        Command::Serve => api::run_http_server(config).await,
        Command::Watch { code, server } => {
            let transport = transport(server, &config)?;
            watch(transport, parse_code(&code)?).await
        }
        Command::Publish {
            code,
            file,
            server,
            keepalive,
        } => {
            let transport = transport(server, &config)?;
            publish(
                &transport,
                &parse_code(&code)?,
                &file,
                keepalive.map(Duration::from_secs),
            )
            .await
        }
        Command::Rooms { server } => rooms(&transport(server, &config)?).await,
    }
}

fn parse_code(raw: &str) -> Result<RoomCode> {
    normalize(raw).with_context(|| format!("invalid room code {raw:?}"))
}

fn transport(server: Option<String>, config: &Config) -> Result<HttpTransport> {
    HttpTransport::new(&server.unwrap_or_else(|| config.local_url()))
}

fn describe(code: &RoomCode, snapshot: &Snapshot) -> String {
    match (&snapshot.image, snapshot.updated_at) {
        (Some(image), Some(at)) => format!("{code} updated {at} ({} chars)", image.len()),
        (None, Some(at)) => format!("{code} updated {at} (no image)"),
        _ => format!("{code} has no snapshot yet"),
    }
}

async fn watch(transport: HttpTransport, code: RoomCode) -> Result<()> {
    let viewer = Viewer::new(transport, Arc::new(SystemClock), ViewerSettings::default());
    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel(4);
    let task = tokio::spawn(viewer.run(code.clone(), tx, cancel.clone()));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
                break;
            }
            update = rx.recv() => match update {
                Some(snapshot) => println!("{}", describe(&code, &snapshot)),
                None => break,
            }
        }
    }
    let reason = task.await?;
    info!(room = %code, ?reason, "stopped watching");
    Ok(())
}

async fn publish(
    transport: &HttpTransport,
    code: &RoomCode,
    file: &Path,
    keepalive: Option<Duration>,
) -> Result<()> {
    let image = image_data_uri(file)?;
    transport.publish(code, image).await?;
    println!("published {} to {code}", file.display());
    let Some(every) = keepalive else {
        return Ok(());
    };
    let mut tick = tokio::time::interval(every);
    tick.tick().await;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            _ = tick.tick() => {
                if let Err(e) = transport.touch(code).await {
                    warn!(room = %code, error = %e, "keepalive failed");
                }
            }
        }
    }
}

async fn rooms(transport: &HttpTransport) -> Result<()> {
    let rooms = transport.rooms().await?;
    if rooms.is_empty() {
        println!("no active rooms");
    }
    for room in rooms {
        let snapshot = Snapshot {
            image: room.image,
            updated_at: room.updated_at,
        };
        println!("{}", describe(&room.code, &snapshot));
    }
    Ok(())
}

//! HTTP client for a running view server.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures::StreamExt;
use reqwest::{header, StatusCode};
use std::path::Path;
use url::Url;
use view_api::{validate_image, ActiveRoom, PublishRequest, RoomCode, RoomsResponse, Snapshot};

use crate::live::viewer::{ByteStream, ViewTransport};

#[derive(Clone, Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
    base: Url,
}

impl HttpTransport {
    pub fn new(base: &str) -> Result<Self> {
        let mut base = Url::parse(base).with_context(|| format!("invalid server url {base}"))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self {
            client: reqwest::Client::new(),
            base,
        })
    }

    fn url(&self, path: &str) -> Result<Url> {
        Ok(self.base.join(path)?)
    }

    fn room_url(&self, code: &RoomCode, suffix: &str) -> Result<Url> {
        self.url(&format!("api/view/{code}{suffix}"))
    }

    pub async fn rooms(&self) -> Result<Vec<ActiveRoom>> {
        let resp = self.client.get(self.url("api/view")?).send().await?;
        let body: RoomsResponse = resp.error_for_status()?.json().await?;
        Ok(body.rooms)
    }

    pub async fn publish(&self, code: &RoomCode, image: String) -> Result<()> {
        let resp = self
            .client
            .post(self.room_url(code, "")?)
            .json(&PublishRequest { image })
            .send()
            .await?;
        expect_no_content(resp).await
    }

    pub async fn touch(&self, code: &RoomCode) -> Result<()> {
        let resp = self.client.post(self.room_url(code, "/touch")?).send().await?;
        expect_no_content(resp).await
    }
}

async fn expect_no_content(resp: reqwest::Response) -> Result<()> {
    let status = resp.status();
    if status == StatusCode::NO_CONTENT {
        return Ok(());
    }
    let reason = resp.text().await.unwrap_or_default();
    bail!("server answered {status}: {reason}")
}

#[async_trait]
impl ViewTransport for HttpTransport {
    async fn open_stream(&self, code: &RoomCode) -> Result<ByteStream> {
        let resp = self
            .client
            .get(self.room_url(code, "/stream?fast=1")?)
            .header(header::ACCEPT, "text/event-stream")
            .send()
            .await?
            .error_for_status()?;
        let is_stream = resp
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.starts_with("text/event-stream"))
            .unwrap_or(false);
        if !is_stream {
            bail!("server did not answer with an event stream");
        }
        Ok(resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(anyhow::Error::from))
            .boxed())
    }

    async fn fetch(&self, code: &RoomCode) -> Result<Snapshot> {
        let resp = self.client.get(self.room_url(code, "")?).send().await?;
        Ok(resp.error_for_status()?.json().await?)
    }
}

/// Read an image file as a data URI the server will accept.
pub fn image_data_uri(path: &Path) -> Result<String> {
    let mime = mime_guess::from_path(path)
        .first()
        .with_context(|| format!("cannot tell the image type of {}", path.display()))?;
    if mime.type_() != mime_guess::mime::IMAGE {
        bail!("{} is not an image ({mime})", path.display());
    }
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let uri = format!("data:{mime};base64,{}", STANDARD.encode(bytes));
    validate_image(&uri).with_context(|| format!("cannot publish {}", path.display()))?;
    Ok(uri)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_are_joined_under_the_base_path() {
        let t = HttpTransport::new("http://localhost:8788/paint").unwrap();
        let code = view_api::normalize("abc").unwrap();
        assert_eq!(
            t.room_url(&code, "/stream?fast=1").unwrap().as_str(),
            "http://localhost:8788/paint/api/view/ABC/stream?fast=1"
        );
        assert!(HttpTransport::new("not a url").is_err());
    }

    #[test]
    fn data_uri_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let png = dir.path().join("frame.png");
        std::fs::write(&png, [0x89, b'P', b'N', b'G']).unwrap();
        assert_eq!(image_data_uri(&png).unwrap(), "data:image/png;base64,iVBORw==");

        let txt = dir.path().join("notes.txt");
        std::fs::write(&txt, "hi").unwrap();
        assert!(image_data_uri(&txt).is_err());
    }
}

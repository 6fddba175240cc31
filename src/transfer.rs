use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::Url;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use tracing::debug;

use crate::error::GamelibError;
use crate::events::CancelToken;
use crate::fs_util::{copy_with_progress, remove_path};

/// Fetches one remote archive to local storage.
pub trait Transfer: Send + Sync {
    /// Declared size of the remote resource, when the server reports one.
    fn probe_size(&self, url: &str) -> Result<Option<u64>, GamelibError>;

    /// Streams `url` into `destination`, calling `on_progress(done, total)`
    /// after every chunk. Returns the number of bytes written. On failure or
    /// cancellation no file is left at `destination`.
    fn fetch(
        &self,
        url: &str,
        destination: &Path,
        cancel: &CancelToken,
        on_progress: &mut dyn FnMut(u64, Option<u64>),
    ) -> Result<u64, GamelibError>;
}

#[derive(Clone)]
pub struct HttpTransfer {
    client: Client,
}

impl HttpTransfer {
    /// `timeout` bounds a whole request including the body; `None` lets
    /// multi-gigabyte transfers run as long as they need.
    pub fn new(timeout: Option<Duration>) -> Result<Self, GamelibError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("gamelib/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| GamelibError::Http(err.to_string()))?,
        );

        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(30))
            .timeout(timeout)
            .build()
            .map_err(|err| GamelibError::Http(err.to_string()))?;

        Ok(Self { client })
    }

    /// Fetches a small text document, such as a shared link list.
    pub fn fetch_text(&self, url: &str) -> Result<String, GamelibError> {
        let parsed =
            Url::parse(url).map_err(|err| GamelibError::InvalidUrl(format!("{url}: {err}")))?;
        let response = self
            .client
            .get(parsed)
            .send()
            .map_err(|err| GamelibError::Http(err.to_string()))?;
        if !response.status().is_success() {
            return Err(GamelibError::Http(format!(
                "GET {url} returned {}",
                response.status()
            )));
        }
        response
            .text()
            .map_err(|err| GamelibError::Http(err.to_string()))
    }
}

impl Transfer for HttpTransfer {
    fn probe_size(&self, url: &str) -> Result<Option<u64>, GamelibError> {
        let response = self
            .client
            .head(url)
            .send()
            .map_err(|err| GamelibError::Http(err.to_string()))?;
        if !response.status().is_success() {
            return Err(GamelibError::Http(format!(
                "HEAD {url} returned {}",
                response.status()
            )));
        }
        Ok(response
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|size| *size > 0))
    }

    fn fetch(
        &self,
        url: &str,
        destination: &Path,
        cancel: &CancelToken,
        on_progress: &mut dyn FnMut(u64, Option<u64>),
    ) -> Result<u64, GamelibError> {
        let probed = match self.probe_size(url) {
            Ok(size) => size,
            Err(err) => {
                debug!(url, error = %err, "size probe unavailable");
                None
            }
        };

        let mut response = self
            .client
            .get(url)
            .send()
            .map_err(|err| GamelibError::TransferFailed(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status();
            return Err(GamelibError::TransferFailed(format!("GET {url} returned {status}")));
        }
        let total = response.content_length().filter(|len| *len > 0).or(probed);

        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).map_err(|err| GamelibError::Filesystem(err.to_string()))?;
        }
        let partial = partial_path(destination);
        let result = (|| {
            let file =
                File::create(&partial).map_err(|err| GamelibError::Filesystem(err.to_string()))?;
            let mut writer = BufWriter::new(file);
            on_progress(0, total);
            let written = copy_with_progress(&mut response, &mut writer, cancel, |done| {
                on_progress(done, total)
            })?;
            drop(writer);
            if let Some(expected) = total {
                if written != expected {
                    return Err(GamelibError::TransferFailed(format!(
                        "short transfer: {written} of {expected} bytes"
                    )));
                }
            }
            fs::rename(&partial, destination)
                .map_err(|err| GamelibError::Filesystem(err.to_string()))?;
            Ok(written)
        })();

        match result {
            Ok(written) => Ok(written),
            Err(err) => {
                let _ = remove_path(&partial);
                match err {
                    GamelibError::Cancelled => Err(GamelibError::Cancelled),
                    GamelibError::TransferFailed(message) => {
                        Err(GamelibError::TransferFailed(message))
                    }
                    other => Err(GamelibError::TransferFailed(other.to_string())),
                }
            }
        }
    }
}

fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    destination.with_file_name(name)
}

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};

use crate::error::AtomsError;
use crate::manifest::url_basename;
use crate::progress::{ProgressEvent, ProgressSink};

const CHUNK_SIZE: usize = 64 * 1024;

pub struct RemoteBody {
    pub len: Option<u64>,
    pub reader: Box<dyn Read + Send>,
}

pub trait DownloadClient: Send + Sync {
    /// Opens a streaming body for `url`. Non-2xx responses are
    /// `AtomsError::HttpStatus`.
    fn open(&self, url: &str) -> Result<RemoteBody, AtomsError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Download {
    pub url: String,
    pub destination: PathBuf,
}

impl Download {
    pub fn new(url: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            destination: destination.into(),
        }
    }
}

#[derive(Clone)]
pub struct HttpDownloadClient {
    client: Client,
}

impl HttpDownloadClient {
    pub fn new() -> Result<Self, AtomsError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("load-atoms/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| AtomsError::Config(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(60 * 60))
            .build()
            .map_err(|err| AtomsError::Http {
                url: String::new(),
                message: err.to_string(),
            })?;
        Ok(Self { client })
    }

    fn send_with_retries(&self, url: &str) -> Result<reqwest::blocking::Response, AtomsError> {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            match self.client.get(url).send() {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        tracing::debug!(url, status, attempt, "retrying request");
                        thread::sleep(Duration::from_millis(BASE_DELAY_MS * (attempt as u64 + 1)));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        tracing::debug!(url, attempt, error = %err, "retrying request");
                        thread::sleep(Duration::from_millis(BASE_DELAY_MS * (attempt as u64 + 1)));
                        attempt += 1;
                        continue;
                    }
                    return Err(AtomsError::Http {
                        url: url.to_string(),
                        message: err.to_string(),
                    });
                }
            }
        }
    }
}

impl DownloadClient for HttpDownloadClient {
    fn open(&self, url: &str) -> Result<RemoteBody, AtomsError> {
        let response = self.send_with_retries(url)?;
        if !response.status().is_success() {
            return Err(AtomsError::HttpStatus {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }
        Ok(RemoteBody {
            len: response.content_length(),
            reader: Box::new(response),
        })
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

/// Streams `url` to `local_path`, returning the path actually written. A
/// directory target receives the url's basename.
pub fn fetch<C>(
    client: &C,
    url: &str,
    local_path: &Path,
    sink: &dyn ProgressSink,
) -> Result<PathBuf, AtomsError>
where
    C: DownloadClient + ?Sized,
{
    let target = if local_path.is_dir() {
        local_path.join(url_basename(url))
    } else {
        local_path.to_path_buf()
    };
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(|err| AtomsError::Filesystem(err.to_string()))?;
    }

    let mut part_name: OsString = target.as_os_str().to_owned();
    part_name.push(".part");
    let part_path = PathBuf::from(part_name);

    tracing::debug!(url, path = %target.display(), "downloading");
    let body = client.open(url)?;
    sink.event(ProgressEvent::FileStarted {
        url: url.to_string(),
        total: body.len,
    });
    let streamed = stream_to_file(url, body.reader, &part_path, sink);
    sink.event(ProgressEvent::FileFinished {
        url: url.to_string(),
    });
    if let Err(err) = streamed {
        let _ = fs::remove_file(&part_path);
        return Err(err);
    }
    fs::rename(&part_path, &target).map_err(|err| AtomsError::Filesystem(err.to_string()))?;
    Ok(target)
}

fn stream_to_file(
    url: &str,
    mut reader: Box<dyn Read + Send>,
    path: &Path,
    sink: &dyn ProgressSink,
) -> Result<(), AtomsError> {
    let mut file = File::create(path)
        .map_err(|err| AtomsError::Filesystem(format!("create {}: {err}", path.display())))?;
    let mut buffer = vec![0u8; CHUNK_SIZE];
    loop {
        let read = reader.read(&mut buffer).map_err(|err| AtomsError::Http {
            url: url.to_string(),
            message: err.to_string(),
        })?;
        if read == 0 {
            break;
        }
        file.write_all(&buffer[..read])
            .map_err(|err| AtomsError::Filesystem(err.to_string()))?;
        sink.event(ProgressEvent::FileAdvanced {
            url: url.to_string(),
            bytes: read as u64,
        });
    }
    file.flush()
        .map_err(|err| AtomsError::Filesystem(err.to_string()))?;
    Ok(())
}

/// Downloads every entry, `workers` at a time. All attempts run to
/// completion; any failures are reported together afterwards.
pub fn fetch_all<C>(
    client: &C,
    downloads: &[Download],
    workers: usize,
    sink: &dyn ProgressSink,
) -> Result<Vec<PathBuf>, AtomsError>
where
    C: DownloadClient + ?Sized,
{
    match downloads {
        [] => return Ok(Vec::new()),
        [single] => {
            return fetch(client, &single.url, &single.destination, sink).map(|path| vec![path]);
        }
        _ => {}
    }

    sink.event(ProgressEvent::BatchStarted {
        total: downloads.len(),
    });
    let next = AtomicUsize::new(0);
    let results: Mutex<Vec<Option<Result<PathBuf, AtomsError>>>> =
        Mutex::new((0..downloads.len()).map(|_| None).collect());
    let pool_size = workers.clamp(1, downloads.len());

    thread::scope(|scope| {
        for _ in 0..pool_size {
            scope.spawn(|| {
                loop {
                    let index = next.fetch_add(1, Ordering::SeqCst);
                    let Some(download) = downloads.get(index) else {
                        break;
                    };
                    let outcome = fetch(client, &download.url, &download.destination, sink);
                    if let Err(err) = &outcome {
                        tracing::warn!(url = %download.url, error = %err, "download failed");
                    }
                    results.lock()[index] = Some(outcome);
                    sink.event(ProgressEvent::BatchAdvanced);
                }
            });
        }
    });

    let mut paths = Vec::with_capacity(downloads.len());
    let mut failures = Vec::new();
    for (download, outcome) in downloads.iter().zip(results.into_inner()) {
        match outcome {
            Some(Ok(path)) => paths.push(path),
            Some(Err(err)) => failures.push(format!("{} ({err})", download.url)),
            None => failures.push(format!("{} (not attempted)", download.url)),
        }
    }
    if !failures.is_empty() {
        return Err(AtomsError::DownloadFailed { failures });
    }
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Cursor;

    use assert_matches::assert_matches;

    use super::*;
    use crate::progress::SilentProgress;

    struct MapClient {
        files: HashMap<String, Vec<u8>>,
        calls: Mutex<usize>,
    }

    impl DownloadClient for MapClient {
        fn open(&self, url: &str) -> Result<RemoteBody, AtomsError> {
            *self.calls.lock() += 1;
            match self.files.get(url) {
                Some(bytes) => Ok(RemoteBody {
                    len: Some(bytes.len() as u64),
                    reader: Box::new(Cursor::new(bytes.clone())),
                }),
                None => Err(AtomsError::HttpStatus {
                    url: url.to_string(),
                    status: 404,
                }),
            }
        }
    }

    fn client(entries: &[(&str, &str)]) -> MapClient {
        MapClient {
            files: entries
                .iter()
                .map(|(url, body)| (url.to_string(), body.as_bytes().to_vec()))
                .collect(),
            calls: Mutex::new(0),
        }
    }

    #[test]
    fn directory_target_uses_basename() {
        let temp = tempfile::tempdir().unwrap();
        let client = client(&[("https://host/data/a.txt", "alpha")]);
        let path = fetch(&client, "https://host/data/a.txt", temp.path(), &SilentProgress).unwrap();
        assert_eq!(path, temp.path().join("a.txt"));
        assert_eq!(fs::read_to_string(path).unwrap(), "alpha");
    }

    #[test]
    fn status_error_leaves_nothing_behind() {
        let temp = tempfile::tempdir().unwrap();
        let client = client(&[]);
        let target = temp.path().join("nested").join("b.txt");
        let err = fetch(&client, "https://host/b.txt", &target, &SilentProgress).unwrap_err();
        assert_matches!(err, AtomsError::HttpStatus { status: 404, .. });
        assert!(!target.exists());
    }

    #[test]
    fn batch_failures_are_aggregated() {
        let temp = tempfile::tempdir().unwrap();
        let client = client(&[
            ("https://host/1.txt", "one"),
            ("https://host/3.txt", "three"),
        ]);
        let downloads: Vec<Download> = (1..=4)
            .map(|i| Download::new(format!("https://host/{i}.txt"), temp.path()))
            .collect();

        let err = fetch_all(&client, &downloads, 8, &SilentProgress).unwrap_err();
        let AtomsError::DownloadFailed { failures } = err else {
            panic!("expected aggregate failure");
        };
        assert_eq!(failures.len(), 2);
        assert!(failures[0].starts_with("https://host/2.txt"));
        assert!(failures[1].starts_with("https://host/4.txt"));
        assert_eq!(*client.calls.lock(), 4);
        assert!(temp.path().join("1.txt").exists());
        assert!(temp.path().join("3.txt").exists());
    }

    #[test]
    fn single_download_is_not_wrapped() {
        let temp = tempfile::tempdir().unwrap();
        let client = client(&[]);
        let downloads = vec![Download::new("https://host/x.txt", temp.path())];
        let err = fetch_all(&client, &downloads, 8, &SilentProgress).unwrap_err();
        assert_matches!(err, AtomsError::HttpStatus { .. });
        assert!(fetch_all(&client, &[], 8, &SilentProgress).unwrap().is_empty());
    }
}

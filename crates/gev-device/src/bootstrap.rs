//! GenICam schema bootstrap.
//!
//! The device publishes up to two URL strings in its bootstrap register
//! block. Each names where the schema lives: inside the device's own memory,
//! on the host filesystem, or on a vendor web server. Zipped payloads are
//! replaced by their first entry.

use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::channel::Channel;
use crate::registers::bootstrap;
use crate::GevError;

/// Deadline for fetching a schema over HTTP.
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Parsed GenICam data location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XmlUrl {
    /// Schema stored in device memory: `local:filename;address;size`
    /// with hexadecimal address and size.
    Device {
        filename: String,
        address: u32,
        size: u32,
    },
    /// Schema on the host filesystem: `file:///path`.
    File { path: PathBuf },
    /// Schema on a web server: `http://…`.
    Http { url: String },
}

impl XmlUrl {
    /// Parse a URL string read from a device register.
    pub fn parse(raw: &str) -> Result<Self, GevError> {
        let raw = raw.trim();
        let (scheme, rest) = raw
            .split_once(':')
            .ok_or_else(|| GevError::invalid(format!("missing URL scheme: {raw}")))?;
        match scheme.to_ascii_lowercase().as_str() {
            "local" => {
                let mut fields = rest.split(';');
                let filename = fields
                    .next()
                    .filter(|name| !name.is_empty())
                    .ok_or_else(|| GevError::invalid("local URL missing file name"))?;
                let address = parse_hex(fields.next(), "address")?;
                let size = parse_hex(fields.next(), "size")?;
                Ok(XmlUrl::Device {
                    filename: filename.to_string(),
                    address,
                    size,
                })
            }
            "file" => {
                // Accept both `file:/path` and `file:///path`.
                let path = rest.strip_prefix("//").unwrap_or(rest);
                if path.is_empty() {
                    return Err(GevError::invalid("file URL missing path"));
                }
                Ok(XmlUrl::File {
                    path: PathBuf::from(path),
                })
            }
            "http" | "https" => Ok(XmlUrl::Http {
                url: raw.to_string(),
            }),
            other => Err(GevError::invalid(format!("unsupported URL scheme: {other}"))),
        }
    }

    /// Whether the named payload is a zip archive.
    pub fn is_zipped(&self) -> bool {
        let name = match self {
            XmlUrl::Device { filename, .. } => filename.as_str(),
            XmlUrl::File { path } => path.to_str().unwrap_or(""),
            XmlUrl::Http { url } => url.as_str(),
        };
        name.len() >= 4 && name[name.len() - 4..].eq_ignore_ascii_case(".zip")
    }
}

fn parse_hex(field: Option<&str>, what: &str) -> Result<u32, GevError> {
    let field = field.ok_or_else(|| GevError::invalid(format!("local URL missing {what}")))?;
    let digits = field.trim().trim_start_matches("0x");
    u32::from_str_radix(digits, 16)
        .map_err(|_| GevError::invalid(format!("bad {what} in local URL: {field}")))
}

/// Retrieve the GenICam data, trying URL slot 0 then slot 1.
pub(crate) async fn load(channel: &Channel) -> Result<(Vec<u8>, XmlUrl), GevError> {
    for slot in [bootstrap::XML_URL_0, bootstrap::XML_URL_1] {
        match load_slot(channel, slot).await {
            Ok(loaded) => return Ok(loaded),
            Err(err) => {
                warn!(slot = format_args!("{slot:#06x}"), error = %err, "XML URL slot failed");
            }
        }
    }
    Err(GevError::GenicamNotFound)
}

async fn load_slot(channel: &Channel, slot: u32) -> Result<(Vec<u8>, XmlUrl), GevError> {
    let mut raw = vec![0u8; bootstrap::XML_URL_SIZE];
    channel.read_memory(slot, &mut raw).await?;
    let text = register_string(&raw).ok_or(GevError::GenicamNotFound)?;
    let url = match XmlUrl::parse(&text) {
        Ok(url) => url,
        Err(err) => {
            error!(url = %text, "cannot handle GenICam URL");
            return Err(err);
        }
    };
    info!(url = %text, "retrieving GenICam data");

    let mut data = fetch(channel, &url).await?;
    if url.is_zipped() {
        data = unzip_first_entry(&data)?;
    }
    if data.is_empty() {
        return Err(GevError::GenicamNotFound);
    }
    Ok((data, url))
}

async fn fetch(channel: &Channel, url: &XmlUrl) -> Result<Vec<u8>, GevError> {
    match url {
        XmlUrl::Device { address, size, .. } => {
            let mut data = vec![0u8; *size as usize];
            channel.read_memory(*address, &mut data).await?;
            Ok(data)
        }
        XmlUrl::File { path } => Ok(std::fs::read(path)?),
        XmlUrl::Http { url } => {
            let url = url.clone();
            tokio::task::spawn_blocking(move || http_fetch(&url))
                .await
                .map_err(|err| GevError::schema(format!("HTTP fetch task failed: {err}")))?
        }
    }
}

fn http_fetch(url: &str) -> Result<Vec<u8>, GevError> {
    let agent = ureq::AgentBuilder::new().timeout(HTTP_TIMEOUT).build();
    let response = agent
        .get(url)
        .call()
        .map_err(|err| GevError::schema(format!("HTTP fetch failed: {err}")))?;
    let mut body = Vec::new();
    response.into_reader().read_to_end(&mut body)?;
    Ok(body)
}

/// Replace a zip archive with its first entry's decompressed contents.
fn unzip_first_entry(data: &[u8]) -> Result<Vec<u8>, GevError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(data))
        .map_err(|err| GevError::schema(format!("invalid GenICam zip: {err}")))?;
    if archive.len() == 0 {
        return Err(GevError::GenicamNotFound);
    }
    let mut entry = archive
        .by_index(0)
        .map_err(|err| GevError::schema(format!("unreadable GenICam zip entry: {err}")))?;
    let mut out = Vec::with_capacity(entry.size() as usize);
    entry.read_to_end(&mut out)?;
    Ok(out)
}

/// Decode a NUL-terminated register string.
pub(crate) fn register_string(bytes: &[u8]) -> Option<String> {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    let text = String::from_utf8_lossy(&bytes[..end]).trim().to_string();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

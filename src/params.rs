//! Merged request parameters.
//!
//! Path params, form params (query string plus url-encoded or multipart
//! body) and a JSON object body collapse into one string-keyed map, built
//! once per request. Later sources overwrite earlier ones, so the
//! precedence is JSON > form > path.

use std::collections::HashMap;
use std::convert::Infallible;
use std::error::Error as StdError;
use std::path::Path;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures_util::Stream;
use serde::de::DeserializeOwned;
use serde_json::{Map, Number, Value};
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::{Error, Result};

/// Multipart parts held in memory, summed over one body. File parts past
/// this budget go to a temporary file instead.
pub const MAX_MULTIPART_MEMORY: u64 = 32 << 20;

/// One uploaded file from a `multipart/form-data` body.
#[derive(Clone, Debug)]
pub struct FileHeader {
    pub filename: String,
    pub content_type: Option<String>,
    size: u64,
    content: FileContent,
}

#[derive(Clone, Debug)]
enum FileContent {
    Memory(Bytes),
    /// Removed from disk when the last handle drops.
    Disk(Arc<NamedTempFile>),
}

impl FileHeader {
    pub fn size(&self) -> u64 { self.size }

    /// Whether the upload outgrew the memory budget and lives on disk.
    pub fn is_on_disk(&self) -> bool { matches!(self.content, FileContent::Disk(_)) }

    /// The temporary file holding a spilled upload.
    pub fn path(&self) -> Option<&Path> {
        match &self.content {
            FileContent::Memory(_) => None,
            FileContent::Disk(file) => Some(file.path()),
        }
    }

    /// The file contents, read back from disk if spilled.
    pub async fn bytes(&self) -> Result<Bytes> {
        match &self.content {
            FileContent::Memory(data) => Ok(data.clone()),
            FileContent::Disk(file) => Ok(tokio::fs::read(file.path()).await?.into()),
        }
    }
}

/// The merged parameter map of one request. Read-only once built.
#[derive(Debug, Default)]
pub struct Params {
    values: Map<String, Value>,
    files: HashMap<String, Vec<FileHeader>>,
}

impl Params {
    /// Merges the three sources in precedence order.
    pub(crate) async fn build(
        path: Vec<(String, String)>,
        query: &str,
        content_type: Option<&str>,
        body: Option<&Bytes>,
    ) -> Self {
        let mut params = Params::default();

        for (k, v) in path {
            params.values.insert(k, Value::String(v));
        }

        // The query string counts as form input; body fields win over query
        // fields of the same name.
        params.insert_form(url::form_urlencoded::parse(query.as_bytes()));

        let content_type = content_type.unwrap_or_default();
        let mime = content_type.split(';').next().unwrap_or_default().trim().to_ascii_lowercase();
        if let Some(body) = body.filter(|b| !b.is_empty()) {
            match mime.as_str() {
                "application/x-www-form-urlencoded" => {
                    params.insert_form(url::form_urlencoded::parse(body));
                }
                "multipart/form-data" => {
                    let body = body.clone();
                    let stream = futures_util::stream::once(async move { Ok::<_, Infallible>(body) });
                    params.insert_multipart(content_type, stream).await;
                }
                _ => {}
            }
            if mime.starts_with("application/json") {
                match serde_json::from_slice::<Map<String, Value>>(body) {
                    Ok(json) => params.values.extend(json),
                    Err(e) => debug!(error = %e, "json body is not an object, skipped"),
                }
            }
        }

        params
    }

    fn insert_form<'a>(&mut self, pairs: impl Iterator<Item = (std::borrow::Cow<'a, str>, std::borrow::Cow<'a, str>)>) {
        let mut seen = std::collections::HashSet::new();
        for (k, v) in pairs {
            // First value of a repeated key.
            if seen.insert(k.clone()) {
                self.values.insert(k.into_owned(), Value::String(v.into_owned()));
            }
        }
    }

    /// Reads a `multipart/form-data` body as it streams in.
    ///
    /// Text fields and file parts share [`MAX_MULTIPART_MEMORY`]. A file
    /// part that would exceed it is written to a temporary file; a text
    /// field that would is skipped. A broken stream keeps every part read
    /// before the failure.
    pub(crate) async fn insert_multipart<S, E>(&mut self, content_type: &str, stream: S)
    where
        S: Stream<Item = std::result::Result<Bytes, E>> + Send,
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        let boundary = match multer::parse_boundary(content_type) {
            Ok(boundary) => boundary,
            Err(e) => {
                debug!(error = %e, "multipart boundary missing, body skipped");
                return;
            }
        };
        let mut multipart = multer::Multipart::new(stream, boundary);

        let mut memory_left = MAX_MULTIPART_MEMORY;
        let mut seen = std::collections::HashSet::new();
        loop {
            let mut field = match multipart.next_field().await {
                Ok(Some(field)) => field,
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "multipart body malformed, remaining fields skipped");
                    break;
                }
            };
            let Some(name) = field.name().map(str::to_owned) else { continue };
            let filename = field.file_name().map(str::to_owned);
            let content_type = field.content_type().map(|m| m.to_string());

            let (content, size) = match read_part(&mut field, filename.is_some(), &mut memory_left).await {
                Ok(read) => read,
                Err(e) => {
                    debug!(field = %name, error = %e, "multipart field unreadable, skipped");
                    continue;
                }
            };

            match (filename, content) {
                (Some(filename), content) => {
                    self.files.entry(name).or_default().push(FileHeader { filename, content_type, size, content });
                }
                (None, FileContent::Memory(data)) if seen.insert(name.clone()) => {
                    let text = String::from_utf8_lossy(&data).into_owned();
                    self.values.insert(name, Value::String(text));
                }
                (None, _) => {}
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> { self.values.get(key) }
    pub fn contains(&self, key: &str) -> bool { self.values.contains_key(key) }
    pub fn as_map(&self) -> &Map<String, Value> { &self.values }

    /// First uploaded file under `name`.
    pub fn file(&self, name: &str) -> Option<&FileHeader> {
        self.files.get(name).and_then(|files| files.first())
    }

    pub fn files(&self, name: &str) -> &[FileHeader] {
        self.files.get(name).map(Vec::as_slice).unwrap_or_default()
    }

    /// The value under `key` converted to `T`; `T`'s zero when absent.
    pub fn value<T: FromParam>(&self, key: &str) -> T {
        self.values.get(key).map(T::from_param).unwrap_or_default()
    }

    /// Like [`value`](Self::value) but `default` replaces an absent or zero result.
    pub fn value_or<T: FromParam>(&self, key: &str, default: T) -> T {
        let value = self.value::<T>(key);
        if value.is_zero() { default } else { value }
    }

    /// Binds the merged map onto `T`, checking [`Bind::REQUIRED`] first.
    pub fn parse<T: Bind>(&self) -> Result<T> {
        if let Some(field) = T::REQUIRED.iter().find(|field| !self.values.contains_key(**field)) {
            return Err(Error::RequiredMissing { field: (*field).to_owned() });
        }
        // Round-trip through JSON so field conversion follows serde's rules.
        let encoded = serde_json::to_vec(&self.values)?;
        Ok(serde_json::from_slice(&encoded)?)
    }
}

/// Drains one part. Buffers it while `memory_left` allows, then spills to
/// a temporary file if `spill` is set and fails otherwise. Only buffered
/// parts are charged to `memory_left`.
async fn read_part(field: &mut multer::Field<'_>, spill: bool, memory_left: &mut u64) -> Result<(FileContent, u64)> {
    let mut buffered = BytesMut::new();
    let mut spilled: Option<(NamedTempFile, tokio::fs::File)> = None;
    let mut size = 0u64;

    while let Some(chunk) = field.chunk().await? {
        size += chunk.len() as u64;
        if let Some((_, out)) = spilled.as_mut() {
            out.write_all(&chunk).await?;
        } else if (buffered.len() + chunk.len()) as u64 <= *memory_left {
            buffered.extend_from_slice(&chunk);
        } else if spill {
            let temp = NamedTempFile::new()?;
            let mut out = tokio::fs::File::from_std(temp.reopen()?);
            out.write_all(&buffered).await?;
            out.write_all(&chunk).await?;
            buffered.clear();
            spilled = Some((temp, out));
        } else {
            return Err(Error::BodyRead(format!(
                "multipart field exceeds the {MAX_MULTIPART_MEMORY} byte memory limit"
            )));
        }
    }

    match spilled {
        Some((temp, mut out)) => {
            out.flush().await?;
            debug!(size, path = %temp.path().display(), "multipart file spilled to disk");
            Ok((FileContent::Disk(Arc::new(temp)), size))
        }
        None => {
            *memory_left -= buffered.len() as u64;
            Ok((FileContent::Memory(buffered.freeze()), size))
        }
    }
}

/// A record [`Params::parse`] can fill.
///
/// `REQUIRED` lists the serialized names (after any `#[serde(rename)]`)
/// that must be present in the merged parameters.
///
/// ```rust
/// use serde::Deserialize;
///
/// #[derive(Deserialize)]
/// struct Login {
///     #[serde(rename = "userName")]
///     user_name: String,
///     #[serde(default)]
///     remember: bool,
/// }
///
/// impl flow::Bind for Login {
///     const REQUIRED: &'static [&'static str] = &["userName"];
/// }
/// ```
pub trait Bind: DeserializeOwned {
    const REQUIRED: &'static [&'static str] = &[];
}

// ── Conversions ──────────────────────────────────────────────────────────────

/// Target types of the typed parameter accessors.
///
/// Numbers format as canonical decimals, strings parse base-10 with zero on
/// failure, booleans are `1`/`0` (or `"1"`/`""`), and anything is true when
/// its numeric value is positive.
pub trait FromParam: Default {
    fn from_param(value: &Value) -> Self;
    fn is_zero(&self) -> bool;
}

fn number_as_f64(n: &Number) -> f64 {
    n.as_f64().unwrap_or(0.0)
}

fn number_as_i64(n: &Number) -> i64 {
    n.as_i64().unwrap_or_else(|| number_as_f64(n) as i64)
}

fn string_as_f64(s: &str) -> f64 {
    s.trim().parse().unwrap_or(0.0)
}

impl FromParam for String {
    fn from_param(value: &Value) -> Self {
        match value {
            Value::String(s) => s.clone(),
            Value::Number(n) => match (n.as_i64(), n.as_u64()) {
                (Some(i), _) => i.to_string(),
                (None, Some(u)) => u.to_string(),
                _ => number_as_f64(n).to_string(),
            },
            Value::Bool(true) => "1".to_owned(),
            _ => String::new(),
        }
    }

    fn is_zero(&self) -> bool { self.is_empty() }
}

impl FromParam for i64 {
    fn from_param(value: &Value) -> Self {
        match value {
            Value::String(s) => s.trim().parse().unwrap_or(0),
            Value::Number(n) => number_as_i64(n),
            Value::Bool(b) => i64::from(*b),
            _ => 0,
        }
    }

    fn is_zero(&self) -> bool { *self == 0 }
}

impl FromParam for i32 {
    fn from_param(value: &Value) -> Self {
        match value {
            Value::String(s) => s.trim().parse().unwrap_or(0),
            Value::Number(n) => number_as_i64(n) as i32,
            Value::Bool(b) => i32::from(*b),
            _ => 0,
        }
    }

    fn is_zero(&self) -> bool { *self == 0 }
}

impl FromParam for f64 {
    fn from_param(value: &Value) -> Self {
        match value {
            Value::String(s) => string_as_f64(s),
            Value::Number(n) => number_as_f64(n),
            Value::Bool(b) => f64::from(u8::from(*b)),
            _ => 0.0,
        }
    }

    fn is_zero(&self) -> bool { *self == 0.0 }
}

impl FromParam for bool {
    fn from_param(value: &Value) -> Self {
        match value {
            Value::Bool(b) => *b,
            Value::Number(n) => number_as_f64(n) > 0.0,
            Value::String(s) => string_as_f64(s) > 0.0,
            _ => false,
        }
    }

    fn is_zero(&self) -> bool { !*self }
}

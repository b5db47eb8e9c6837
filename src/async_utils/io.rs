//! Reading config files and record streams, and writing JSONL.
//!
//! Record input may be JSONL or CSV. We decide which by file extension, or,
//! for stdin, by peeking at the first byte: JSONL records always start with
//! `{`.

use std::{pin::Pin, sync::Arc, task::Context};

use futures::{TryStreamExt, pin_mut, stream::StreamExt as _};
use peekable::tokio::AsyncPeekable;
use serde_json::Map;
use tokio::{
    fs::File,
    io::{
        AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt as _, AsyncWrite,
        AsyncWriteExt as _, BufReader, BufWriter, ReadBuf,
    },
};
use tokio_stream::wrappers::LinesStream;

use super::{BoxedStream, size_hint::WithSizeHintExt};
use crate::{
    prelude::*,
    ui::{ProgressConfig, Ui},
};

/// A buffered reader which knows whether its contents look like JSON.
pub struct SmartReader {
    is_json_like: bool,

    /// Where the data comes from, for error messages.
    description: String,

    reader: Pin<Box<dyn AsyncBufRead + Unpin + Send + Sync + 'static>>,
}

impl SmartReader {
    /// Wrap `reader`, sniffing the first byte to guess the format. Empty input
    /// is treated as CSV.
    pub async fn new_from_reader(
        description: String,
        reader: impl AsyncRead + Unpin + Send + Sync + 'static,
    ) -> Result<Self> {
        let mut peekable = AsyncPeekable::new(Box::new(BufReader::new(reader)));
        let mut first = [0u8; 1];
        let is_json_like = match peekable.peek_exact(&mut first).await {
            Ok(_) => first[0] == b'{',
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => false,
            Err(err) => {
                return Err(err).with_context(|| format!("could not read {description}"));
            }
        };
        Ok(Self {
            is_json_like,
            description,
            reader: Box::pin(BufReader::new(peekable)),
        })
    }

    /// Open `path`, guessing the format from its extension.
    pub async fn new_from_path(path: &Path) -> Result<Self> {
        let ext = path.extension().unwrap_or_default();
        let is_json_like = ext == "json" || ext == "jsonl";
        let file = File::open(path)
            .await
            .with_context(|| format!("could not open {}", path.display()))?;
        Ok(Self {
            is_json_like,
            description: path.display().to_string(),
            reader: Box::pin(BufReader::new(file)),
        })
    }

    /// Open `path`, or stdin if there's no path.
    pub async fn new_from_path_or_stdin(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::new_from_path(path).await,
            None => Self::new_from_reader("stdin".to_owned(), tokio::io::stdin()).await,
        }
    }

    pub fn is_json_like(&self) -> bool {
        self.is_json_like
    }
}

impl AsyncRead for SmartReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        Pin::get_mut(self).reader.as_mut().poll_read(cx, buf)
    }
}

impl AsyncBufRead for SmartReader {
    fn poll_fill_buf(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> std::task::Poll<std::io::Result<&[u8]>> {
        Pin::get_mut(self).reader.as_mut().poll_fill_buf(cx)
    }

    fn consume(self: Pin<&mut Self>, amt: usize) {
        Pin::get_mut(self).reader.as_mut().consume(amt)
    }
}

/// Read a whole TOML or JSON file into `T`.
pub async fn read_json_or_toml<T>(path: &Path) -> Result<T>
where
    T: serde::de::DeserializeOwned,
{
    let mut reader = SmartReader::new_from_path(path).await?;
    let mut data = String::new();
    reader
        .read_to_string(&mut data)
        .await
        .with_context(|| format!("could not read {}", path.display()))?;
    if reader.is_json_like() {
        serde_json::from_str(&data)
            .with_context(|| format!("could not parse JSON in {}", path.display()))
    } else {
        toml::from_str(&data)
            .with_context(|| format!("could not parse TOML in {}", path.display()))
    }
}

/// Count the records in a JSONL or CSV file, so we can show a real progress
/// bar. Returns an unknown count for anything that isn't a regular file.
#[instrument(level = "debug", skip_all, fields(path = %path.display()))]
pub async fn count_jsonl_or_csv_records(
    ui: &Ui,
    path: &Path,
) -> Result<(usize, Option<usize>)> {
    if !path.is_file() {
        return Ok((0, None));
    }

    let spinner = ui.new_spinner(&ProgressConfig {
        emoji: "🧮",
        msg: "Counting input records",
        done_msg: "Counted input records",
    });
    let reader = SmartReader::new_from_path(path).await?;
    let count = if reader.is_json_like() {
        LinesStream::new(reader.lines())
            .try_filter(|line| futures::future::ready(!line.trim().is_empty()))
            .try_fold(0, |acc, _line| async move { Ok(acc + 1) })
            .await?
    } else {
        csv_async::AsyncReaderBuilder::new()
            .create_reader(reader)
            .into_byte_records()
            .try_fold(0, |acc, _record| async move { Ok(acc + 1) })
            .await?
    };
    spinner.finish_with_message(format!("Found {count} records"));
    Ok((count, Some(count)))
}

/// A JSON object, without the [`Value::Object`] wrapper.
pub type JsonObject = Map<String, Value>;

/// A stream of JSON values.
pub type JsonStream = BoxedStream<Result<Value>>;

/// Read JSONL or CSV records from a file or stdin. CSV rows become JSON
/// objects with string values, keyed by the header row.
pub async fn read_jsonl_or_csv(ui: Ui, path: Option<&Path>) -> Result<JsonStream> {
    let size_hint = match path {
        Some(path) => count_jsonl_or_csv_records(&ui, path).await?,
        None => (0, None),
    };

    let reader = SmartReader::new_from_path_or_stdin(path).await?;
    let description = Arc::new(reader.description.clone());
    if reader.is_json_like() {
        let lines = LinesStream::new(reader.lines())
            .try_filter(|line| futures::future::ready(!line.trim().is_empty()))
            .with_size_hint(size_hint);
        Ok(Box::pin(lines.map(move |line| {
            let line = line?;
            serde_json::from_str::<Value>(&line).with_context(|| {
                format!("could not parse JSON line in {description}: {line:?}")
            })
        })))
    } else {
        let mut reader = csv_async::AsyncReaderBuilder::new().create_reader(reader);
        let headers = Arc::new(
            reader
                .headers()
                .await
                .with_context(|| format!("could not read CSV headers from {description}"))?
                .to_owned(),
        );
        Ok(Box::pin(reader.into_records().with_size_hint(size_hint).map(
            move |record| {
                let record = record
                    .with_context(|| format!("could not read CSV record from {description}"))?;
                let object = headers
                    .iter()
                    .zip(record.iter())
                    .map(|(header, value)| (header.to_owned(), Value::String(value.to_owned())))
                    .collect::<JsonObject>();
                Ok(Value::Object(object))
            },
        )))
    }
}

/// Open `path` for writing, or stdout if there's no path.
pub async fn create_writer(
    path: Option<&Path>,
) -> Result<Box<dyn AsyncWrite + Unpin + Send + Sync + 'static>> {
    match path {
        Some(path) => {
            let file = File::create(path)
                .await
                .with_context(|| format!("could not create {}", path.display()))?;
            Ok(Box::new(file))
        }
        None => Ok(Box::new(tokio::io::stdout())),
    }
}

/// Write each value in `stream` as one line of JSON.
pub async fn write_jsonl(path: Option<&Path>, stream: JsonStream) -> Result<()> {
    let mut writer = BufWriter::new(create_writer(path).await?);
    pin_mut!(stream);
    while let Some(value) = stream.next().await {
        let mut line = serde_json::to_vec(&value?).context("could not serialize record")?;
        line.push(b'\n');
        writer
            .write_all(&line)
            .await
            .context("could not write output record")?;
    }
    writer.flush().await.context("could not flush output")?;
    Ok(())
}

use std::{
	io,
	path::{Component, Path, PathBuf},
	pin::Pin,
	sync::Arc,
	task::{ready, Context, Poll},
};

use thiserror::Error;
use tokio::{
	fs::File,
	io::{AsyncRead, AsyncReadExt, ReadBuf, Take},
};
use tokio_util::io::ReaderStream;
use tracing::{debug, info_span, warn, Instrument};

use crate::{
	catalog::{CatalogError, CatalogStore},
	models::{FileKey, Identity, ROOT_FOLDER},
};

const CHUNK_SIZE: usize = 256 * 1024; // 256KB

#[derive(Debug, Error)]
pub enum DeliveryError {
	/// No catalog entry, or one owned by someone else. Callers cannot tell
	/// the two apart.
	#[error("file not found")]
	NotFound,

	#[error("invalid path: {0}")]
	InvalidPath(String),

	#[error("catalog entry {0} has no file on disk")]
	StaleCatalogEntry(FileKey),

	#[error(transparent)]
	StoreUnavailable(#[from] CatalogError),

	#[error("I/O error: {0}")]
	Io(String),
}

/// An authorized, opened file ready to be sent.
///
/// Dropping it (or the stream made from it) closes the file.
pub struct Delivery {
	pub filename: String,
	pub size: u64,
	reader: FileBody,
}

impl std::fmt::Debug for Delivery {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Delivery")
			.field("filename", &self.filename)
			.field("size", &self.size)
			.finish_non_exhaustive()
	}
}

impl Delivery {
	/// Byte stream of exactly `size` bytes, in 256KB chunks. A read error
	/// ends the stream with that error; nothing is retried.
	pub fn into_stream(self) -> ReaderStream<FileBody> {
		ReaderStream::with_capacity(self.reader, CHUNK_SIZE)
	}

	pub fn into_reader(self) -> FileBody {
		self.reader
	}
}

/// The open file, capped at the size announced to the caller.
///
/// Bytes appended after the open are never sent. Reaching end of file before
/// the announced size is an `UnexpectedEof` error rather than a short body.
pub struct FileBody {
	inner: Take<File>,
	remaining: u64,
}

impl FileBody {
	fn new(file: File, size: u64) -> Self {
		Self { inner: file.take(size), remaining: size }
	}
}

impl AsyncRead for FileBody {
	fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
		let this = &mut *self;
		let before = buf.filled().len();
		ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;

		let read = (buf.filled().len() - before) as u64;
		if read == 0 && this.remaining > 0 && buf.remaining() > 0 {
			return Poll::Ready(Err(io::Error::new(
				io::ErrorKind::UnexpectedEof,
				format!("file shrank with {} bytes still to send", this.remaining),
			)));
		}
		this.remaining -= read;
		Poll::Ready(Ok(()))
	}
}

/// Serves catalogued files to their owners.
#[derive(Clone)]
pub struct DeliveryService {
	store: Arc<dyn CatalogStore>,
	root: PathBuf,
}

impl DeliveryService {
	pub fn new(store: Arc<dyn CatalogStore>, root: PathBuf) -> Self {
		Self { store, root }
	}

	/// Authorize `identity` for `(folder, name)` and open the file.
	///
	/// Ownership is checked before the path is even built, and the path is
	/// confined to the root before anything is opened.
	pub async fn deliver(&self, identity: &Identity, folder: &str, name: &str) -> Result<Delivery, DeliveryError> {
		let key = FileKey::new(folder, name);
		let span = info_span!("deliver", user = %identity.id, %key);
		self.deliver_key(identity, key).instrument(span).await
	}

	async fn deliver_key(&self, identity: &Identity, key: FileKey) -> Result<Delivery, DeliveryError> {
		match self.store.find_owner(&key).await? {
			None => return Err(DeliveryError::NotFound),
			Some(owner) if !identity.owns(&owner) => {
				debug!("requester is not the owner");
				return Err(DeliveryError::NotFound);
			}
			Some(_) => {}
		}

		let path = resolve_path(&self.root, &key)?;
		let real = self.confine(&path, &key).await?;

		let file = File::open(&real).await.map_err(|e| map_io_error(e, &key))?;
		let metadata = file.metadata().await.map_err(|e| map_io_error(e, &key))?;
		if !metadata.is_file() {
			warn!("catalog entry points at a non-file");
			return Err(DeliveryError::StaleCatalogEntry(key));
		}

		let size = metadata.len();
		debug!(size, "streaming");
		Ok(Delivery { filename: key.name, size, reader: FileBody::new(file, size) })
	}

	/// Resolve symlinks and reject anything that lands outside the root.
	///
	/// A root that has vanished means every entry is stale, not that the
	/// request failed.
	async fn confine(&self, path: &Path, key: &FileKey) -> Result<PathBuf, DeliveryError> {
		let root = tokio::fs::canonicalize(&self.root).await.map_err(|e| map_io_error(e, key))?;
		let real = tokio::fs::canonicalize(path).await.map_err(|e| map_io_error(e, key))?;
		if !real.starts_with(&root) {
			warn!(target_path = %real.display(), "resolved path escapes the root");
			return Err(DeliveryError::InvalidPath(key.to_string()));
		}
		Ok(real)
	}
}

/// Join `key` onto `root`, refusing any segment that is not a plain name.
pub fn resolve_path(root: &Path, key: &FileKey) -> Result<PathBuf, DeliveryError> {
	let mut path = root.to_path_buf();
	if key.folder != ROOT_FOLDER {
		for segment in key.folder.split('/') {
			check_segment(segment, key)?;
			path.push(segment);
		}
	}
	check_segment(&key.name, key)?;
	path.push(&key.name);
	Ok(path)
}

fn check_segment(segment: &str, key: &FileKey) -> Result<(), DeliveryError> {
	let invalid = || DeliveryError::InvalidPath(key.to_string());
	if segment.is_empty() || segment.contains(['/', '\\', '\0']) {
		return Err(invalid());
	}
	let mut components = Path::new(segment).components();
	match (components.next(), components.next()) {
		(Some(Component::Normal(_)), None) => Ok(()),
		_ => Err(invalid()),
	}
}

fn map_io_error(err: io::Error, key: &FileKey) -> DeliveryError {
	match err.kind() {
		io::ErrorKind::NotFound | io::ErrorKind::NotADirectory => {
			warn!("catalogued file is missing on disk");
			DeliveryError::StaleCatalogEntry(key.clone())
		}
		_ => DeliveryError::Io(format!("{key}: {err}")),
	}
}

//! Peer state and the block transfer state machine
//!
//! A [`Peer`] owns a root directory, the index published for it, the
//! roster of known contacts, and the in-flight reconstruction state. Each
//! stream is handled by its own task; the mutable state sits behind one
//! coarse async lock. The protocol is best-effort: a handler failure is
//! logged and the offending message dropped, never answered with an
//! error, and `waiting`/`pending` only change on the explicit transitions
//! of the sync state machine (so a spurious message cannot abort a
//! healthy transfer).
//!
//! Client-side flow: `sync_over` marks the peer waiting, sends an
//! IndexRequest and then drives the stream until every pending file has
//! been reassembled. Block requests for all pending files are pipelined
//! on the one stream; responses may interleave arbitrarily.

use crate::block::{slice_file, BLOCK_SIZE};
use crate::broker::{Contact, Roster};
use crate::index::Index;
use crate::io::{remove_file_safe, write_atomic};
use crate::proto::{send, Message, MessageReader, RecvError};
use crate::summary::Summary;
use ahash::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default permission mode for reconstructed files that had no local
/// predecessor.
const DEFAULT_FILE_MODE: u32 = 0o644;

/// Errors local to the transfer handlers. Never sent to the peer.
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("no transfer pending for file {0}")]
    Unexpected(Uuid),

    #[error("block from peer {got:?}, expected {expected:?}")]
    WrongPeer { expected: String, got: String },

    #[error("block for file {got}, pending transfer is {expected}")]
    IdMismatch { expected: Uuid, got: Uuid },

    #[error("block {n} out of range for a file of {len} blocks")]
    OutOfRange { n: u8, len: usize },

    #[error("block {0} was not marked changed")]
    UnexpectedBlock(u8),

    #[error("no file {} with id {id} in the index", .path.display())]
    NotFound { path: PathBuf, id: Uuid },

    #[error("unsolicited index content from {0:?}")]
    UnsolicitedIndex(String),

    #[error(transparent)]
    Recv(#[from] RecvError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

#[cfg(unix)]
fn file_mode(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode()
}

#[cfg(not(unix))]
fn file_mode(_meta: &fs::Metadata) -> u32 {
    DEFAULT_FILE_MODE
}

/// In-flight reconstruction of one remote file.
///
/// Block slots are preallocated to the target length and pre-filled from
/// the local copy wherever the diff summary holds the `0` "unchanged"
/// sentinel; the remaining slots are filled by incoming BlockContent
/// messages. The file is written out once every slot is populated.
#[derive(Debug)]
pub struct RequestedFile {
    /// Peer expected to supply the missing blocks.
    contact: String,
    /// Target summary; `blocks` is the diff form (0 = reuse local).
    summary: Summary,
    slots: Vec<Option<Vec<u8>>>,
    /// Absolute path the finished file is written to.
    target: PathBuf,
    /// Permission mode of the prior local copy, when there was one.
    mode: Option<u32>,
}

impl RequestedFile {
    pub fn new(summary: Summary, contact: &str, root: &Path) -> Self {
        let target = root.join(&summary.path);
        let mut slots: Vec<Option<Vec<u8>>> = vec![None; summary.blocks.len()];

        if summary.blocks.contains(&0) {
            // Positions marked unchanged are satisfied locally, up front
            if let Ok(local) = slice_file(&target) {
                for (n, block) in local.into_iter().enumerate() {
                    if summary.blocks.get(n) == Some(&0) {
                        slots[n] = Some(block.into_content());
                    }
                }
            }
        }
        let mode = fs::metadata(&target).ok().map(|meta| file_mode(&meta));

        Self { contact: contact.to_string(), summary, slots, target, mode }
    }

    pub fn summary(&self) -> &Summary {
        &self.summary
    }

    pub fn contact(&self) -> &str {
        &self.contact
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Block positions still missing, in order.
    pub fn wanted(&self) -> impl Iterator<Item = u8> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_none())
            .map(|(n, _)| n as u8)
    }

    pub fn is_complete(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }

    fn store(&mut self, block_n: u8, content: Vec<u8>) -> Result<(), TransferError> {
        let n = block_n as usize;
        if n >= self.summary.blocks.len() {
            return Err(TransferError::OutOfRange { n: block_n, len: self.summary.blocks.len() });
        }
        if self.summary.blocks[n] == 0 {
            return Err(TransferError::UnexpectedBlock(block_n));
        }
        self.slots[n] = Some(content);
        Ok(())
    }

    fn assemble(&self) -> Vec<u8> {
        let mut content = Vec::new();
        for slot in self.slots.iter().flatten() {
            content.extend_from_slice(slot);
        }
        content
    }

    /// Write the finished file atomically with its stored permissions.
    fn write(&self) -> io::Result<()> {
        if let Some(parent) = self.target.parent() {
            fs::create_dir_all(parent)?;
        }
        write_atomic(&self.target, &self.assemble(), Some(self.mode.unwrap_or(DEFAULT_FILE_MODE)))
    }
}

#[derive(Default)]
struct PeerState {
    root_index: Index,
    /// An IndexRequest is outstanding.
    waiting: bool,
    pending: HashMap<Uuid, RequestedFile>,
}

/// One device participating in the sync mesh.
pub struct Peer {
    root: PathBuf,
    peer_id: String,
    roster: Roster,
    state: Mutex<PeerState>,
}

impl Peer {
    pub fn new(
        root: PathBuf,
        peer_id: impl Into<String>,
        roster: Roster,
        root_index: Index,
    ) -> Self {
        Self {
            root,
            peer_id: peer_id.into(),
            roster,
            state: Mutex::new(PeerState { root_index, ..PeerState::default() }),
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn root_index(&self) -> Index {
        self.state.lock().await.root_index.clone()
    }

    /// Swap in a freshly rescanned index.
    pub async fn set_root_index(&self, index: Index) {
        self.state.lock().await.root_index = index;
    }

    pub async fn pending_transfers(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    /// Accept inbound streams forever, one task per connection.
    ///
    /// Inbound streams carry no authenticated identity here (the
    /// transport layer of the full system provides it), so they can only
    /// request data, never push content into a pending transfer.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> io::Result<()> {
        info!(addr = %listener.local_addr()?, peer_id = %self.peer_id, "serving");
        loop {
            let (stream, addr) = listener.accept().await?;
            let peer = Arc::clone(&self);
            tokio::spawn(async move {
                debug!(%addr, "inbound stream");
                peer.handle_stream(stream, None).await;
            });
        }
    }

    /// Drive one stream: receive messages, dispatch each, answer on the
    /// same stream. Handler failures are logged and dropped; framing
    /// failures close the stream.
    pub async fn handle_stream<S>(&self, stream: S, remote: Option<&str>)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (read, mut write) = tokio::io::split(stream);
        let mut reader = MessageReader::new(read);
        loop {
            match reader.recv().await {
                Ok(Some(message)) => {
                    if let Err(e) = self.dispatch(message, remote, &mut write).await {
                        warn!(error = %e, "dropping message");
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "closing stream");
                    break;
                }
            }
        }
        let _ = write.shutdown().await;
    }

    /// Synchronize this root with `contact` over an established stream.
    ///
    /// Sends the IndexRequest and processes responses until no transfer
    /// is pending. On a transport error all pending state is dropped; the
    /// peer returns to idle and may retry later.
    pub async fn sync_over<S>(&self, stream: S, contact: &Contact) -> Result<(), TransferError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.state.lock().await.waiting = true;

        let (read, mut write) = tokio::io::split(stream);
        let mut reader = MessageReader::new(read);
        send(&mut write, &Message::IndexRequest).await?;
        debug!(peer = %contact.peer_id, "index requested");

        loop {
            let message = match reader.recv().await {
                Ok(Some(message)) => message,
                Ok(None) => {
                    self.reset_transfers().await;
                    return Err(RecvError::Disconnected.into());
                }
                Err(e) => {
                    self.reset_transfers().await;
                    return Err(e.into());
                }
            };
            if let Err(e) = self.dispatch(message, Some(&contact.peer_id), &mut write).await {
                warn!(error = %e, "dropping message");
            }

            let state = self.state.lock().await;
            if !state.waiting && state.pending.is_empty() {
                info!(peer = %contact.peer_id, "sync complete");
                return Ok(());
            }
        }
    }

    /// Connect to `contact` and run [`sync_over`](Peer::sync_over).
    pub async fn sync_with(&self, contact: &Contact) -> Result<(), TransferError> {
        let stream = TcpStream::connect(&contact.addr).await?;
        self.sync_over(stream, contact).await
    }

    async fn reset_transfers(&self) {
        let mut state = self.state.lock().await;
        state.waiting = false;
        state.pending.clear();
    }

    async fn dispatch<W>(
        &self,
        message: Message,
        remote: Option<&str>,
        write: &mut W,
    ) -> Result<(), TransferError>
    where
        W: AsyncWrite + Unpin,
    {
        match message {
            Message::BlockRequest { file_id, block_n, path } => {
                let response = self.handle_block_request(file_id, block_n, &path).await?;
                send(write, &response).await?;
            }
            Message::BlockContent { file_id, block_n, content, .. } => {
                self.handle_block_content(remote, file_id, block_n, content).await?;
            }
            Message::IndexRequest => {
                let index = self.state.lock().await.root_index.clone();
                send(write, &Message::IndexContent(index)).await?;
            }
            Message::IndexContent(index) => {
                for request in self.handle_index_content(remote, index).await? {
                    send(write, &request).await?;
                }
            }
        }
        Ok(())
    }

    /// Serve one block of a file under this root.
    ///
    /// The file is sliced fresh on every request: its blocks may have
    /// changed since the index was published, and the peer serves what is
    /// on disk at the moment of service.
    async fn handle_block_request(
        &self,
        file_id: Uuid,
        block_n: u8,
        path: &Path,
    ) -> Result<Message, TransferError> {
        {
            let state = self.state.lock().await;
            match state.root_index.files.get(path) {
                Some(s) if s.id == file_id => {}
                _ => return Err(TransferError::NotFound { path: path.to_path_buf(), id: file_id }),
            }
        }

        let blocks = slice_file(&self.root.join(path))?;
        let block = blocks
            .get(block_n as usize)
            .ok_or(TransferError::OutOfRange { n: block_n, len: blocks.len() })?;

        Ok(Message::BlockContent {
            file_id,
            block_n,
            block_size: (BLOCK_SIZE / 1024) as u16,
            content: block.content().to_vec(),
        })
    }

    /// Store one received block into its pending transfer; write the file
    /// out when it was the last missing piece.
    async fn handle_block_content(
        &self,
        remote: Option<&str>,
        file_id: Uuid,
        block_n: u8,
        content: Vec<u8>,
    ) -> Result<(), TransferError> {
        let mut state = self.state.lock().await;
        let pending = state
            .pending
            .get_mut(&file_id)
            .ok_or(TransferError::Unexpected(file_id))?;

        let remote = remote.unwrap_or_default();
        if pending.contact != remote {
            return Err(TransferError::WrongPeer {
                expected: pending.contact.clone(),
                got: remote.to_string(),
            });
        }
        if pending.summary.id != file_id {
            return Err(TransferError::IdMismatch { expected: pending.summary.id, got: file_id });
        }
        pending.store(block_n, content)?;

        if pending.is_complete() {
            if let Some(finished) = state.pending.remove(&file_id) {
                drop(state);
                finished.write()?;
                info!(path = %finished.target.display(), "file reassembled");
            }
        }
        Ok(())
    }

    /// Accept a peer's index while waiting for one: delete locally what
    /// the peer tombstoned, stage every addition as a pending transfer,
    /// and return the block requests to issue.
    async fn handle_index_content(
        &self,
        remote: Option<&str>,
        received: Index,
    ) -> Result<Vec<Message>, TransferError> {
        let remote = remote
            .filter(|id| self.roster.lookup(id).is_some())
            .ok_or_else(|| TransferError::UnsolicitedIndex(remote.unwrap_or("?").to_string()))?;

        let mut state = self.state.lock().await;
        if !state.waiting {
            return Err(TransferError::UnsolicitedIndex(remote.to_string()));
        }
        state.waiting = false;

        let comparison = state.root_index.compare(&received);
        info!(
            peer = %remote,
            additions = comparison.additions.len(),
            deletions = comparison.deletions.len(),
            "index received"
        );

        for path in &comparison.deletions {
            if let Err(e) = remove_file_safe(&self.root.join(path)) {
                warn!(path = %path.display(), error = %e, "deletion failed");
            }
        }

        let mut requests = Vec::new();
        for (path, partial) in comparison.additions {
            if partial.blocks.len() > usize::from(u8::MAX) + 1 {
                warn!(path = %path.display(), "file exceeds block addressing range, skipped");
                continue;
            }
            let requested = RequestedFile::new(partial, remote, &self.root);
            if requested.is_complete() {
                // Every block was reusable locally (or the file is empty)
                requested.write()?;
                continue;
            }
            let file_id = requested.summary.id;
            for block_n in requested.wanted() {
                requests.push(Message::BlockRequest { file_id, block_n, path: path.clone() });
            }
            state.pending.insert(file_id, requested);
        }
        Ok(requests)
    }
}

//! Receiving station: answers the sender's protocol and stores every
//! reassembled blob under the output directory.

use crate::transfer::message::Message;
use crate::transfer::reassembly::Reassembler;
use crate::xbee::api::{ApiFrame, Destination};
use crate::xbee::codec::ResponseFrame;
use crate::xbee::transport::{FrameIdAllocator, FrameSink};
use anyhow::{anyhow, Result};
use chrono::Utc;
use log::{debug, info, trace, warn};
use std::future::Future;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

pub struct Listener<S: FrameSink> {
    sink: S,
    reply_template: Destination,
    reassembler: Reassembler,
    frame_ids: FrameIdAllocator,
    output_dir: PathBuf,
    peer: Option<u64>,
}

impl<S: FrameSink> Listener<S> {
    /// Replies go to whichever address the message came from, using the
    /// radius and options of `reply_template`.
    pub fn new(sink: S, reply_template: Destination, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            sink,
            reply_template,
            reassembler: Reassembler::default(),
            frame_ids: FrameIdAllocator::new(),
            output_dir: output_dir.into(),
            peer: None,
        }
    }

    /// Ignore stations other than `peer`.
    pub fn only_from(mut self, peer: u64) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Process one decoded frame. Returns the path of a blob completed by it.
    pub async fn handle_frame(&mut self, frame: ResponseFrame) -> Result<Option<PathBuf>> {
        if !frame.is_ok() {
            return Ok(None);
        }
        let api = match ApiFrame::parse(&frame) {
            Ok(api) => api,
            Err(e) => {
                debug!("listener: unparseable api frame: {}", e);
                return Ok(None);
            }
        };
        let (src, data) = match (&api, api.source64(), api.rf_data()) {
            (_, Some(src), Some(data)) => (src, data),
            (ApiFrame::TxStatus(st), _, _) => {
                trace!(
                    "listener: reply fid {} delivery 0x{:02x}",
                    st.frame_id,
                    st.delivery_status
                );
                return Ok(None);
            }
            _ => return Ok(None),
        };
        if let Some(peer) = self.peer {
            if peer != src {
                debug!("listener: ignoring {:016x}", src);
                return Ok(None);
            }
        }
        let msg = match Message::parse(data) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("listener: dropping message from {:016x}: {}", src, e);
                return Ok(None);
            }
        };

        let reply = self.reassembler.handle(&msg);
        let dest = Destination {
            address64: src,
            ..self.reply_template
        };
        for response in reply.responses {
            self.reply(&dest, response)?;
        }
        match reply.completed {
            Some(blob) => {
                let name = format!(
                    "blob-{}-{:03}.bin",
                    Utc::now().format("%Y%m%dT%H%M%S%.3fZ"),
                    blob.request_id
                );
                let path = self.output_dir.join(name);
                tokio::fs::write(&path, &blob.data)
                    .await
                    .map_err(|e| anyhow!("Failed to write {}: {}", path.display(), e))?;
                info!(
                    "stored {} bytes (crc32 {:08x}) at {}",
                    blob.data.len(),
                    blob.crc32,
                    path.display()
                );
                Ok(Some(path))
            }
            None => Ok(None),
        }
    }

    fn reply(&mut self, dest: &Destination, msg: Message) -> Result<()> {
        let fid = self.frame_ids.next_id();
        let frame = dest.request(fid, msg.encode()).into_frame();
        self.sink
            .send_frame(&frame)
            .map_err(|e| anyhow!("Failed to send reply 0x{:02x}: {}", msg.tag(), e))
    }

    /// Consume frames until the channel closes or `shutdown` resolves.
    /// Returns the number of blobs stored.
    pub async fn run<F>(
        &mut self,
        mut frames: mpsc::UnboundedReceiver<ResponseFrame>,
        shutdown: F,
    ) -> Result<usize>
    where
        F: Future<Output = ()>,
    {
        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|e| anyhow!("Failed to create {}: {}", self.output_dir.display(), e))?;
        info!("listening; blobs go to {}", self.output_dir.display());
        tokio::pin!(shutdown);
        let mut stored = 0usize;
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                frame = frames.recv() => {
                    let Some(frame) = frame else {
                        debug!("listener: frame channel closed");
                        break;
                    };
                    match self.handle_frame(frame).await {
                        Ok(Some(_)) => stored += 1,
                        Ok(None) => {}
                        Err(e) => warn!("listener: {}", e),
                    }
                }
            }
        }
        info!("listener stopped after {} blob(s)", stored);
        Ok(stored)
    }
}

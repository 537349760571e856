//! The single append point for the cache log.
//!
//! All writes funnel through one thread fed by a bounded channel: stages
//! enqueue `(key, field)` pairs and never touch the file.  The bound gives
//! backpressure — a stage that outruns the disk blocks on `append` instead
//! of growing an unbounded queue.  IO errors are logged and swallowed; a
//! failing disk degrades the run to uncached, it does not kill it.

use std::fs::File;
use std::io::Write;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Sender};
use log::warn;

use super::{encode_record, CacheField};
use crate::identity::CacheKey;

enum WriteCmd {
    Append(CacheKey, CacheField),
    /// Drain, fsync, then acknowledge.
    Flush(Sender<()>),
}

pub struct CacheWriter {
    tx:     Option<Sender<WriteCmd>>,
    handle: Option<JoinHandle<()>>,
}

impl CacheWriter {
    /// `file` must be positioned at the append point.
    pub fn spawn(mut file: File, queue_bound: usize) -> Self {
        let (tx, rx) = bounded::<WriteCmd>(queue_bound.max(1));

        let handle = std::thread::Builder::new()
            .name("viddup-cache-writer".into())
            .spawn(move || {
                for cmd in rx {
                    match cmd {
                        WriteCmd::Append(key, field) => {
                            match encode_record(&key, &field) {
                                Ok(bytes) => {
                                    if let Err(e) = file.write_all(&bytes) {
                                        warn!(target: "cache", "append failed: {e}");
                                    }
                                }
                                Err(e) => {
                                    warn!(target: "cache", "unencodable record: {e}");
                                }
                            }
                        }
                        WriteCmd::Flush(ack) => {
                            if let Err(e) = file.flush().and_then(|()| file.sync_data()) {
                                warn!(target: "cache", "flush failed: {e}");
                            }
                            let _ = ack.send(());
                        }
                    }
                }
                // Channel closed: final flush on the way out.
                if let Err(e) = file.flush().and_then(|()| file.sync_data()) {
                    warn!(target: "cache", "final flush failed: {e}");
                }
            })
            .expect("spawn cache writer thread");

        Self { tx: Some(tx), handle: Some(handle) }
    }

    /// Enqueue one append.  Blocks when the queue is full (backpressure);
    /// a closed channel — writer already gone — is logged and dropped.
    pub fn append(&self, key: CacheKey, field: CacheField) {
        if let Some(tx) = &self.tx {
            if tx.send(WriteCmd::Append(key, field)).is_err() {
                warn!(target: "cache", "writer thread gone; dropping append");
            }
        }
    }

    /// Block until everything queued so far is written and fsync'd.
    pub fn flush(&self) {
        let Some(tx) = &self.tx else { return };
        let (ack_tx, ack_rx) = bounded(1);
        if tx.send(WriteCmd::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.recv();
        }
    }
}

impl Drop for CacheWriter {
    fn drop(&mut self) {
        // Closing the channel lets the thread drain the queue and exit.
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{write_header, Cache};
    use crate::hasher::{Digest, FullHash, HashAlgo};
    use std::io::Seek;

    #[test]
    fn writer_appends_loadable_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.bin");
        let mut file = File::create(&path).unwrap();
        write_header(&mut file).unwrap();
        file.seek(std::io::SeekFrom::End(0)).unwrap();

        let key = CacheKey { dev: 9, inode: 9, size: 9, mtime: 9.0 };
        let field = CacheField::Full(FullHash {
            algo:   HashAlgo::Blake3,
            digest: Digest([0x42; 32]),
        });

        {
            let writer = CacheWriter::spawn(file, 4);
            writer.append(key, field);
            writer.flush();
        } // drop joins the thread

        let cache = Cache::open(&path).unwrap();
        assert_eq!(cache.load_stats().records_loaded, 1);
        assert_eq!(cache.lookup(&key).unwrap().full_hash.unwrap().digest, Digest([0x42; 32]));
    }
}

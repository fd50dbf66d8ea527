// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Point-in-time save and restore of the resource graph together with its producers.
//!
//! A save runs in three steps: every producer is paused and reaches a quiescent point, the
//! registry is written, then each producer appends its own state. Registry state always comes
//! first in the stream so that producer state referring to a handle is only ever restored after
//! that handle exists again. Producers are released with `resume_all` once the caller is done.

mod stream;

use std::io::Read;
use std::io::Write;
use std::sync::Arc;

use log::info;

pub use stream::ReadBeExt;
pub use stream::WriteBeExt;

use crate::error::GfxstreamResult;
use crate::registry::ResourceRegistry;

/// A thread that must be quiesced around a snapshot.
pub trait SnapshotProducer: Send + Sync {
    /// Asks the producer to stop at its next safe point. Does not wait.
    fn pause_pre_snapshot(&self);

    /// Waits until the producer is quiescent, then writes `[success:u8]` and, on success, its
    /// length-prefixed state. A producer that exited first writes only a zero byte.
    fn save(&self, writer: &mut dyn Write) -> GfxstreamResult<()>;

    /// Lets a paused or freshly restored producer run again.
    fn resume(&self);
}

pub fn pause_all(producers: &[Arc<dyn SnapshotProducer>]) {
    for producer in producers {
        producer.pause_pre_snapshot();
    }
}

pub fn resume_all(producers: &[Arc<dyn SnapshotProducer>]) {
    for producer in producers {
        producer.resume();
    }
}

/// Writes the registry followed by every producer. Producers must have been paused.
pub fn save(
    registry: &ResourceRegistry,
    producers: &[Arc<dyn SnapshotProducer>],
    writer: &mut dyn Write,
) -> GfxstreamResult<()> {
    registry.save(writer)?;
    writer.put_count(producers.len())?;
    for producer in producers {
        producer.save(writer)?;
    }
    info!("saved {} resources and {} producers", registry.len(), producers.len());
    Ok(())
}

/// Restores the registry and returns the saved state of each producer, in save order. `None`
/// marks a producer that had already exited when the snapshot was taken.
pub fn load(
    registry: &ResourceRegistry,
    reader: &mut dyn Read,
) -> GfxstreamResult<Vec<Option<Vec<u8>>>> {
    registry.load(reader)?;
    let count = reader.get_be32()?;
    let mut producers = Vec::new();
    for _ in 0..count {
        let state = if reader.get_bool()? {
            Some(reader.get_blob()?)
        } else {
            None
        };
        producers.push(state);
    }
    info!("loaded {} resources and {} producers", registry.len(), count);
    Ok(producers)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::backend::HostMemoryBackend;
    use crate::clock::ManualClock;
    use crate::config::RegistryConfig;
    use crate::sync::Mutex;
    use crate::thread_info::ThreadInfoTable;

    #[derive(Default)]
    struct FakeProducer {
        log: Mutex<Vec<&'static str>>,
        exited: bool,
    }

    impl SnapshotProducer for FakeProducer {
        fn pause_pre_snapshot(&self) {
            self.log.lock().push("pause");
        }

        fn save(&self, writer: &mut dyn Write) -> GfxstreamResult<()> {
            self.log.lock().push("save");
            if self.exited {
                return writer.put_bool(false);
            }
            writer.put_bool(true)?;
            writer.put_blob(b"state")
        }

        fn resume(&self) {
            self.log.lock().push("resume");
        }
    }

    fn registry() -> ResourceRegistry {
        ResourceRegistry::new(
            Arc::new(HostMemoryBackend::new()),
            Arc::new(ManualClock::new(0)),
            RegistryConfig::default(),
            ThreadInfoTable::new(),
        )
    }

    #[test]
    fn producers_follow_the_registry() {
        let live = Arc::new(FakeProducer::default());
        let exited = Arc::new(FakeProducer {
            exited: true,
            ..Default::default()
        });
        let producers: Vec<Arc<dyn SnapshotProducer>> = vec![live.clone(), exited.clone()];

        let registry = registry();
        pause_all(&producers);
        let mut bytes = Vec::new();
        save(&registry, &producers, &mut bytes).unwrap();
        resume_all(&producers);
        assert_eq!(*live.log.lock(), vec!["pause", "save", "resume"]);

        let restored = load(&registry, &mut Cursor::new(bytes)).unwrap();
        assert_eq!(restored, vec![Some(b"state".to_vec()), None]);
    }
}

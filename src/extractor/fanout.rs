//! Deliver the content of a single entry to several callbacks.
//!
//! Small entries are read once into memory and every callback gets its own
//! cursor. Large entries are forked: each callback runs in its own thread
//! and receives the chunks read from the entry through a bounded channel,
//! so memory usage does not depend on the size of the entry.

use std::{
    io::{self, Cursor, Read},
    panic::{self, AssertUnwindSafe},
    sync::{
        mpsc::{self, Receiver, SyncSender},
        Arc,
    },
    thread,
};

use super::action::{ExtractAction, FileContent};

/// Size of the chunks sent to forked callbacks.
const CHUNK_SIZE: usize = 64 * 1024;

/// Maximum number of chunks waiting to be consumed by a callback.
const QUEUE_LIMIT: usize = 16;

/// Run the callbacks of `actions` over the content of `entry`.
///
/// The result of each callback is returned in the same order as `actions`.
/// The outer error is a failure to read `entry` itself.
///
/// `entry` may not be fully consumed; the caller must drain it.
pub(crate) fn dispatch(
    entry: &mut dyn Read,
    size: u64,
    actions: &[&ExtractAction],
    buffer_limit: u64,
) -> io::Result<Vec<io::Result<FileContent>>> {
    match actions {
        [] => Ok(Vec::new()),

        [action] => Ok(vec![run(action, entry)]),

        _ if size <= buffer_limit => {
            let mut data = Vec::with_capacity(size as usize);
            entry.read_to_end(&mut data)?;

            Ok(actions
                .iter()
                .map(|action| run(action, &mut Cursor::new(&data[..])))
                .collect())
        }

        _ => fork(entry, actions),
    }
}

/// Run the callback of `action`. A panic is returned as an error.
fn run(action: &ExtractAction, reader: &mut dyn Read) -> io::Result<FileContent> {
    panic::catch_unwind(AssertUnwindSafe(|| action.run(reader)))
        .unwrap_or_else(|_| Err(panicked()))
}

fn panicked() -> io::Error {
    io::Error::other("callback panicked")
}

fn fork(
    entry: &mut dyn Read,
    actions: &[&ExtractAction],
) -> io::Result<Vec<io::Result<FileContent>>> {
    thread::scope(|scope| {
        let mut senders = Vec::with_capacity(actions.len());
        let mut workers = Vec::with_capacity(actions.len());

        for action in actions {
            let (sender, receiver) = mpsc::sync_channel(QUEUE_LIMIT);
            senders.push(Some(sender));

            workers.push(scope.spawn(move || {
                let mut reader = ChannelReader::new(receiver);
                run(action, &mut reader)
            }));
        }

        let copied = copy_chunks(entry, &mut senders);

        // Close the channels, so the callbacks get EOF.
        drop(senders);

        let results = workers
            .into_iter()
            .map(|worker| worker.join().unwrap_or_else(|_| Err(panicked())))
            .collect();

        copied.map(|_| results)
    })
}

/// Send the content of `entry` to every open channel.
///
/// A channel is closed when its callback returns, and then it is removed
/// from the list. Reading continues if there are no more channels, so
/// the entry is always consumed.
fn copy_chunks(
    entry: &mut dyn Read,
    senders: &mut [Option<SyncSender<Arc<[u8]>>>],
) -> io::Result<()> {
    let mut buffer = vec![0; CHUNK_SIZE];

    loop {
        let n = match entry.read(&mut buffer) {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };

        let chunk: Arc<[u8]> = Arc::from(&buffer[..n]);

        for slot in senders.iter_mut() {
            if let Some(sender) = slot {
                if sender.send(Arc::clone(&chunk)).is_err() {
                    *slot = None;
                }
            }
        }
    }
}

/// `Read` implementation on top of the chunks from a channel.
struct ChannelReader {
    receiver: Receiver<Arc<[u8]>>,
    chunk: Option<Arc<[u8]>>,
    position: usize,
}

impl ChannelReader {
    fn new(receiver: Receiver<Arc<[u8]>>) -> Self {
        ChannelReader {
            receiver,
            chunk: None,
            position: 0,
        }
    }
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            if let Some(chunk) = &self.chunk {
                let pending = &chunk[self.position..];
                if !pending.is_empty() {
                    let n = pending.len().min(buf.len());
                    buf[..n].copy_from_slice(&pending[..n]);
                    self.position += n;
                    return Ok(n);
                }
            }

            match self.receiver.recv() {
                Ok(chunk) => {
                    self.chunk = Some(chunk);
                    self.position = 0;
                }

                // All data sent.
                Err(_) => return Ok(0),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{extractor::action::read_bytes, PathMatcher};

    fn actions() -> Vec<ExtractAction> {
        vec![
            ExtractAction::bytes("bytes", PathMatcher::exact("/f")),
            ExtractAction::sha256("hash", PathMatcher::exact("/f")),
            // Read only the first 10 bytes.
            ExtractAction::new("head", PathMatcher::exact("/f"), |reader| {
                let mut head = [0; 10];
                reader.read_exact(&mut head)?;
                Ok(FileContent::Binary(head.to_vec()))
            }),
        ]
    }

    fn content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn buffered_and_forked_are_equivalent() {
        let data = content(CHUNK_SIZE * 3 + 17);
        let actions = actions();
        let actions: Vec<_> = actions.iter().collect();

        let buffered = dispatch(
            &mut Cursor::new(&data),
            data.len() as u64,
            &actions,
            u64::MAX,
        )
        .unwrap();

        let forked = dispatch(&mut Cursor::new(&data), data.len() as u64, &actions, 0).unwrap();

        for (a, b) in buffered.into_iter().zip(forked) {
            assert_eq!(a.unwrap(), b.unwrap());
        }
    }

    #[test]
    fn forked_callbacks_get_whole_content() {
        let data = content(CHUNK_SIZE * QUEUE_LIMIT * 4);
        let actions = actions();
        let actions: Vec<_> = actions.iter().collect();

        let results = dispatch(&mut Cursor::new(&data), data.len() as u64, &actions, 0).unwrap();

        assert_eq!(results[0].as_ref().unwrap().as_bytes(), &data[..]);
        assert_eq!(results[2].as_ref().unwrap().as_bytes(), &data[..10]);

        let expected = crate::digest::sha256_digest(&mut Cursor::new(&data)).unwrap();
        assert_eq!(results[1].as_ref().unwrap().as_text(), Some(&expected[..]));
    }

    #[test]
    fn failures_are_isolated() {
        let data = content(CHUNK_SIZE * 8);

        let failing = ExtractAction::new("fail", PathMatcher::exact("/f"), |_| {
            Err(io::Error::other("broken callback"))
        });

        let panicking = ExtractAction::new("panic", PathMatcher::exact("/f"), |_| {
            panic!("broken callback")
        });

        let good = ExtractAction::new("good", PathMatcher::exact("/f"), read_bytes);

        let actions = [&failing, &panicking, &good];
        let results = dispatch(&mut Cursor::new(&data), data.len() as u64, &actions, 0).unwrap();

        assert!(results[0].is_err());
        assert!(results[1].is_err());
        assert_eq!(results[2].as_ref().unwrap().as_bytes(), &data[..]);

        // Buffered.
        let results = dispatch(&mut Cursor::new(&data), data.len() as u64, &actions, u64::MAX)
            .unwrap();

        assert!(results[1].is_err());
        assert_eq!(results[2].as_ref().unwrap().as_bytes(), &data[..]);
    }

    #[test]
    fn single_callback_panic() {
        let panicking = ExtractAction::new("panic", PathMatcher::exact("/f"), |_| {
            panic!("broken callback")
        });

        let results = dispatch(&mut Cursor::new(b"data"), 4, &[&panicking], 0).unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].as_ref().unwrap_err().to_string(), "callback panicked");
    }
}

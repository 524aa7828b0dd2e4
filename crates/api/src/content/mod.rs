//! Content generation.
//!
//! The content hook that wins a request returns a [`ContentHandler`]. The
//! host wraps it in a [`ContentStream`], which enforces the handler's
//! lifecycle:
//!
//! ```text
//! Created -> ReceivingInput -> InputDone -> GeneratingOutput -> Done
//! ```
//!
//! Request body chunks go in through [`ContentStream::push_input`], ending
//! with an empty chunk. Response bytes come out through
//! [`ContentStream::pull_output`] until the handler reports completion.
//!
//! A handler backed by an external producer, e.g. a child process, registers
//! the producer's file descriptor as its [`ReadinessSource`]. The stream then
//! only asks for output once the descriptor is readable, instead of polling
//! the handler in a loop.

use std::fmt;
use std::io;
#[cfg(unix)]
use std::os::fd::{AsFd, OwnedFd};

use bytes::BytesMut;
use thiserror::Error;
#[cfg(unix)]
use tokio::io::Interest;
#[cfg(unix)]
use tokio::io::unix::AsyncFd;
use tracing::trace;

use crate::dispose::{Dispose, Owned};
use crate::protocol::HttpResponse;

/// Serves the body of one request.
pub trait ContentHandler: Dispose + Send {
    /// Receives a request body chunk. An empty chunk marks the end of input.
    ///
    /// Returns `true` once the handler needs no more input.
    fn in_content(&mut self, response: &mut HttpResponse, chunk: &[u8]) -> bool;

    /// Appends the next piece of response body to `output`.
    ///
    /// Returns `true` once the whole body has been produced.
    fn out_content(&mut self, response: &mut HttpResponse, output: &mut BytesMut) -> bool;
}

/// Where a content handler's output comes from.
#[derive(Debug, Default)]
pub enum ReadinessSource {
    /// Output can be produced on demand.
    #[default]
    None,
    /// Output is available when this descriptor becomes readable. The
    /// descriptor is a duplicate owned by the source; the handler keeps
    /// reading through its own.
    #[cfg(unix)]
    Fd(OwnedFd),
}

impl ReadinessSource {
    /// Watches a duplicate of `fd`.
    ///
    /// # Errors
    ///
    /// Fails when the descriptor can't be duplicated.
    #[cfg(unix)]
    pub fn from_fd(fd: impl AsFd) -> io::Result<Self> {
        Ok(Self::Fd(fd.as_fd().try_clone_to_owned()?))
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

/// Lifecycle state of a [`ContentStream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentState {
    Created,
    ReceivingInput,
    InputDone,
    GeneratingOutput,
    Done,
}

#[derive(Error, Debug)]
pub enum ContentError {
    #[error("{operation} is not allowed in state {state:?}")]
    InvalidState { state: ContentState, operation: &'static str },

    #[error("readiness source error: {source}")]
    Readiness {
        #[from]
        source: io::Error,
    },
}

impl ContentError {
    fn invalid_state(state: ContentState, operation: &'static str) -> Self {
        Self::InvalidState { state, operation }
    }
}

/// A content handler driven through its lifecycle.
pub struct ContentStream {
    // declared before `handler` so the descriptor is deregistered before the
    // handler closes it
    #[cfg(unix)]
    registration: Option<AsyncFd<OwnedFd>>,
    handler: Owned<dyn ContentHandler>,
    source: ReadinessSource,
    state: ContentState,
}

impl ContentStream {
    pub fn new(handler: Owned<dyn ContentHandler>, source: ReadinessSource) -> Self {
        Self {
            #[cfg(unix)]
            registration: None,
            handler,
            source,
            state: ContentState::Created,
        }
    }

    pub fn state(&self) -> ContentState {
        self.state
    }

    pub fn source(&self) -> &ReadinessSource {
        &self.source
    }

    /// Returns whether the handler accepts no more input.
    pub fn input_closed(&self) -> bool {
        !matches!(self.state, ContentState::Created | ContentState::ReceivingInput)
    }

    /// Delivers a request body chunk. An empty chunk ends the input.
    ///
    /// # Errors
    ///
    /// Fails with [`ContentError::InvalidState`] once input is closed.
    pub fn push_input(&mut self, response: &mut HttpResponse, chunk: &[u8]) -> Result<bool, ContentError> {
        if self.input_closed() {
            return Err(ContentError::invalid_state(self.state, "push_input"));
        }

        let done = self.handler.in_content(response, chunk);
        self.state = if done || chunk.is_empty() { ContentState::InputDone } else { ContentState::ReceivingInput };
        trace!(len = chunk.len(), done, "content input");
        Ok(done)
    }

    /// Appends the next piece of response body to `output`.
    ///
    /// With a readiness source the call waits until the descriptor is readable
    /// and returns once the handler produced bytes or finished.
    ///
    /// # Errors
    ///
    /// Fails with [`ContentError::InvalidState`] before input is closed or
    /// after output is done, and with [`ContentError::Readiness`] when the
    /// descriptor cannot be watched.
    pub async fn pull_output(&mut self, response: &mut HttpResponse, output: &mut BytesMut) -> Result<bool, ContentError> {
        if !matches!(self.state, ContentState::InputDone | ContentState::GeneratingOutput) {
            return Err(ContentError::invalid_state(self.state, "pull_output"));
        }
        self.state = ContentState::GeneratingOutput;

        let done = match self.source {
            ReadinessSource::None => self.handler.out_content(response, output),
            #[cfg(unix)]
            ReadinessSource::Fd(_) => self.pull_when_ready(response, output).await?,
        };

        if done {
            self.state = ContentState::Done;
        }
        Ok(done)
    }

    #[cfg(unix)]
    async fn pull_when_ready(&mut self, response: &mut HttpResponse, output: &mut BytesMut) -> Result<bool, ContentError> {
        let registration = match (self.registration.take(), &self.source) {
            (Some(registration), _) => registration,
            (None, ReadinessSource::Fd(fd)) => AsyncFd::with_interest(fd.try_clone()?, Interest::READABLE)?,
            (None, ReadinessSource::None) => return Ok(self.handler.out_content(response, output)),
        };
        let registration = self.registration.insert(registration);

        loop {
            let mut guard = registration.readable().await?;
            let before = output.len();
            let done = self.handler.out_content(response, output);
            if done || output.len() > before {
                return Ok(done);
            }
            // woken without data, wait for the next edge
            guard.clear_ready();
        }
    }

    /// Deregisters the readiness source and disposes the handler.
    pub fn release(mut self) {
        #[cfg(unix)]
        drop(self.registration.take());
        trace!(state = ?self.state, "content handler released");
    }
}

impl fmt::Debug for ContentStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentStream")
            .field("handler", &self.handler)
            .field("source", &self.source)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct Echo {
        received: Vec<u8>,
        sent: bool,
        disposed: Arc<AtomicBool>,
    }

    impl Dispose for Echo {
        fn dispose(self: Box<Self>) {
            self.disposed.store(true, Ordering::SeqCst);
        }
    }

    impl ContentHandler for Echo {
        fn in_content(&mut self, _response: &mut HttpResponse, chunk: &[u8]) -> bool {
            self.received.extend_from_slice(chunk);
            false
        }

        fn out_content(&mut self, _response: &mut HttpResponse, output: &mut BytesMut) -> bool {
            if !self.sent {
                output.extend_from_slice(&self.received);
                self.sent = true;
                return false;
            }
            true
        }
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let disposed = Arc::new(AtomicBool::new(false));
        let handler = Echo { disposed: Arc::clone(&disposed), ..Echo::default() };
        let mut stream = ContentStream::new(crate::owned!(handler), ReadinessSource::None);
        let mut response = HttpResponse::new();
        assert_eq!(stream.state(), ContentState::Created);

        assert!(!stream.push_input(&mut response, b"abc").unwrap());
        assert_eq!(stream.state(), ContentState::ReceivingInput);
        stream.push_input(&mut response, b"").unwrap();
        assert_eq!(stream.state(), ContentState::InputDone);

        let mut output = BytesMut::new();
        assert!(!stream.pull_output(&mut response, &mut output).await.unwrap());
        assert!(stream.pull_output(&mut response, &mut output).await.unwrap());
        assert_eq!(&output[..], b"abc");
        assert_eq!(stream.state(), ContentState::Done);

        stream.release();
        assert!(disposed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_out_of_order_calls_fail() {
        let mut stream = ContentStream::new(crate::owned!(Echo::default()), ReadinessSource::None);
        let mut response = HttpResponse::new();
        let mut output = BytesMut::new();

        let err = stream.pull_output(&mut response, &mut output).await.unwrap_err();
        assert!(matches!(err, ContentError::InvalidState { state: ContentState::Created, .. }));

        stream.push_input(&mut response, b"").unwrap();
        let err = stream.push_input(&mut response, b"late").unwrap_err();
        assert!(matches!(err, ContentError::InvalidState { state: ContentState::InputDone, .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_output_waits_for_readiness() {
        use std::io::{ErrorKind, Read, Write};
        use std::os::unix::net::UnixStream;
        use std::sync::atomic::AtomicUsize;
        use std::time::Duration;

        struct Reader {
            stream: UnixStream,
            calls: Arc<AtomicUsize>,
        }

        impl Dispose for Reader {}

        impl ContentHandler for Reader {
            fn in_content(&mut self, _response: &mut HttpResponse, _chunk: &[u8]) -> bool {
                true
            }

            fn out_content(&mut self, _response: &mut HttpResponse, output: &mut BytesMut) -> bool {
                self.calls.fetch_add(1, Ordering::SeqCst);
                let mut buf = [0u8; 64];
                loop {
                    match self.stream.read(&mut buf) {
                        Ok(0) => return true,
                        Ok(n) => output.extend_from_slice(&buf[..n]),
                        Err(e) if e.kind() == ErrorKind::WouldBlock => return false,
                        Err(_) => return true,
                    }
                }
            }
        }

        let (mut producer, consumer) = UnixStream::pair().unwrap();
        consumer.set_nonblocking(true).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let source = ReadinessSource::from_fd(&consumer).unwrap();
        let handler = Reader { stream: consumer, calls: Arc::clone(&calls) };
        let mut stream = ContentStream::new(crate::owned!(handler), source);
        let mut response = HttpResponse::new();
        stream.push_input(&mut response, b"").unwrap();

        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            producer.write_all(b"late").unwrap();
        });

        let mut output = BytesMut::new();
        let mut done = stream.pull_output(&mut response, &mut output).await.unwrap();
        // nothing was readable before the producer wrote
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(&output[..], b"late");

        writer.await.unwrap();
        while !done {
            done = stream.pull_output(&mut response, &mut output).await.unwrap();
        }
        assert_eq!(&output[..], b"late");
    }

    #[test]
    fn test_drop_disposes_handler() {
        let disposed = Arc::new(AtomicBool::new(false));
        let handler = Echo { disposed: Arc::clone(&disposed), ..Echo::default() };
        drop(ContentStream::new(crate::owned!(handler), ReadinessSource::None));
        assert!(disposed.load(Ordering::SeqCst));
    }
}

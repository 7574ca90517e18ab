/// Off-context crypto jobs
///
/// Jobs are plain data and `run` has no access to endpoint state, so they can
/// execute on any thread. Results come back as `CryptoCompletion`s over an
/// unbounded channel which the endpoint drains on its own context.

use super::{accept_intro, generate_intro, open_frame, seal_frame, CryptoError, SharedKey};
use crate::identity::Identity;
use crate::service::{
    ConvoTag, Introduction, ProtocolFrame, ProtocolMessage, ProtocolType, ServiceAddress,
    ServiceInfo,
};
use hsnet_common::{HsNetError, Result};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Semaphore};
use tracing::warn;

pub type CompletionSender = mpsc::UnboundedSender<CryptoCompletion>;

/// Result of the initiator half of a handshake
#[derive(Debug, Clone)]
pub struct GeneratedIntro {
    pub tag: ConvoTag,
    pub key: SharedKey,
    pub frame: ProtocolFrame,
}

/// Result of the responder half of a handshake
#[derive(Debug, Clone)]
pub struct AcceptedIntro {
    pub key: SharedKey,
    pub message: ProtocolMessage,
}

#[derive(Debug)]
pub enum CryptoJob {
    /// Start a conversation with `remote`
    GenIntro {
        identity: Arc<Identity>,
        remote: ServiceInfo,
        seqno: u64,
        reply_intro: Option<Introduction>,
        protocol: ProtocolType,
        payload: Vec<u8>,
    },
    /// Seal a message on an established conversation
    Encrypt {
        identity: Arc<Identity>,
        key: SharedKey,
        tag: ConvoTag,
        seqno: u64,
        reply_intro: Option<Introduction>,
        protocol: ProtocolType,
        payload: Vec<u8>,
    },
    /// Open a frame with a known conversation key
    Decrypt { key: SharedKey, frame: ProtocolFrame },
    /// Open a handshake frame for an unknown conversation
    AcceptIntro {
        identity: Arc<Identity>,
        frame: ProtocolFrame,
    },
}

#[derive(Debug)]
pub enum CryptoCompletion {
    IntroGenerated {
        remote: ServiceAddress,
        result: std::result::Result<GeneratedIntro, CryptoError>,
    },
    Encrypted {
        tag: ConvoTag,
        result: std::result::Result<ProtocolFrame, CryptoError>,
    },
    Decrypted {
        tag: ConvoTag,
        result: std::result::Result<ProtocolMessage, CryptoError>,
    },
    IntroAccepted {
        tag: ConvoTag,
        result: std::result::Result<AcceptedIntro, CryptoError>,
    },
}

impl CryptoJob {
    pub fn run(self) -> CryptoCompletion {
        match self {
            CryptoJob::GenIntro {
                identity,
                remote,
                seqno,
                reply_intro,
                protocol,
                payload,
            } => {
                let message = ProtocolMessage {
                    protocol,
                    // replaced by the freshly generated tag
                    tag: ConvoTag::from_bytes([0; 16]),
                    seqno,
                    sender: *identity.info(),
                    reply_intro,
                    payload,
                };
                CryptoCompletion::IntroGenerated {
                    remote: remote.address(),
                    result: generate_intro(&identity, &remote, message),
                }
            }
            CryptoJob::Encrypt {
                identity,
                key,
                tag,
                seqno,
                reply_intro,
                protocol,
                payload,
            } => {
                let message = ProtocolMessage {
                    protocol,
                    tag,
                    seqno,
                    sender: *identity.info(),
                    reply_intro,
                    payload,
                };
                CryptoCompletion::Encrypted {
                    tag,
                    result: seal_frame(&key, &identity, &message, None),
                }
            }
            CryptoJob::Decrypt { key, frame } => CryptoCompletion::Decrypted {
                tag: frame.tag,
                result: open_frame(&key, &frame),
            },
            CryptoJob::AcceptIntro { identity, frame } => CryptoCompletion::IntroAccepted {
                tag: frame.tag,
                result: accept_intro(&identity, &frame),
            },
        }
    }
}

/// Somewhere to run crypto jobs
pub trait CryptoWorker: Send + Sync {
    fn submit(&self, job: CryptoJob, done: CompletionSender);
}

/// Runs jobs on tokio's blocking pool, at most `max_in_flight` at a time
///
/// Jobs beyond the limit wait for a permit; nothing is dropped.
pub struct WorkerPool {
    runtime: Handle,
    permits: Arc<Semaphore>,
}

impl WorkerPool {
    /// Must be called from within a tokio runtime
    pub fn new(max_in_flight: usize) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| HsNetError::internal(format!("no tokio runtime: {}", e)))?;
        Ok(Self {
            runtime,
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
        })
    }
}

impl CryptoWorker for WorkerPool {
    fn submit(&self, job: CryptoJob, done: CompletionSender) {
        let permits = self.permits.clone();
        let runtime = self.runtime.clone();
        self.runtime.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                warn!("Crypto worker pool closed, dropping job");
                return;
            };
            match runtime.spawn_blocking(move || job.run()).await {
                Ok(completion) => {
                    let _ = done.send(completion);
                }
                Err(e) => warn!("Crypto job panicked: {}", e),
            }
        });
    }
}

/// Runs jobs immediately on the calling thread
///
/// Completions still go through the channel, so ordering relative to the
/// endpoint's drain points is the same as with a real pool.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineWorker;

impl CryptoWorker for InlineWorker {
    fn submit(&self, job: CryptoJob, done: CompletionSender) {
        let _ = done.send(job.run());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encrypt_job(identity: &Arc<Identity>, key: &SharedKey, seqno: u64) -> CryptoJob {
        CryptoJob::Encrypt {
            identity: identity.clone(),
            key: key.clone(),
            tag: ConvoTag::from_bytes([5; 16]),
            seqno,
            reply_intro: None,
            protocol: ProtocolType::Text,
            payload: b"payload".to_vec(),
        }
    }

    #[test]
    fn test_inline_worker_delivers_through_channel() {
        let identity = Arc::new(Identity::generate());
        let key = SharedKey::from_bytes([9; 32]);
        let (tx, mut rx) = mpsc::unbounded_channel();

        InlineWorker.submit(encrypt_job(&identity, &key, 1), tx.clone());
        let frame = match rx.try_recv().unwrap() {
            CryptoCompletion::Encrypted { result, .. } => result.unwrap(),
            other => panic!("unexpected completion {:?}", other),
        };

        InlineWorker.submit(CryptoJob::Decrypt { key, frame }, tx);
        match rx.try_recv().unwrap() {
            CryptoCompletion::Decrypted { tag, result } => {
                assert_eq!(tag, ConvoTag::from_bytes([5; 16]));
                assert_eq!(result.unwrap().payload, b"payload");
            }
            other => panic!("unexpected completion {:?}", other),
        }
    }

    #[test]
    fn test_pool_requires_runtime() {
        assert!(WorkerPool::new(2).is_err());
    }

    #[tokio::test]
    async fn test_pool_runs_all_jobs() {
        let pool = WorkerPool::new(1).unwrap();
        let identity = Arc::new(Identity::generate());
        let key = SharedKey::from_bytes([1; 32]);
        let (tx, mut rx) = mpsc::unbounded_channel();

        for seqno in 0..4 {
            pool.submit(encrypt_job(&identity, &key, seqno), tx.clone());
        }

        let mut seen = Vec::new();
        for _ in 0..4 {
            match rx.recv().await.unwrap() {
                CryptoCompletion::Encrypted { result, .. } => seen.push(result.unwrap().seqno),
                other => panic!("unexpected completion {:?}", other),
            }
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_gen_intro_job_reports_remote() {
        let alice = Arc::new(Identity::generate());
        let bob = Identity::generate();
        let job = CryptoJob::GenIntro {
            identity: alice,
            remote: *bob.info(),
            seqno: 0,
            reply_intro: None,
            protocol: ProtocolType::Control,
            payload: Vec::new(),
        };
        match job.run() {
            CryptoCompletion::IntroGenerated { remote, result } => {
                assert_eq!(remote, bob.address());
                let generated = result.unwrap();
                assert_eq!(generated.frame.tag, generated.tag);
            }
            other => panic!("unexpected completion {:?}", other),
        }
    }
}

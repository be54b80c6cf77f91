//! Mach message correlation
//!
//! A kernel message buffer (kmsg) is named by address in the send, receive
//! and free records. A [`NurseryMachMsg`] per address absorbs those records
//! until one message's halves are known, then hands back an immutable
//! [`MachineMachMsg`].

use super::voucher::VoucherRef;
use super::ThreadHandle;
use crate::error::MsgTransitionError;
use crate::time::AbsTime;
use serde::Serialize;

/// One observed half of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MsgEndpoint {
    /// Machine generation whose event array `event_index` points into
    pub generation: u32,
    pub event_index: usize,
    pub time: AbsTime,
    pub tid: u64,
    /// `None` if the thread record did not survive generation forwarding
    pub thread: Option<ThreadHandle>,
    pub voucher: VoucherRef,
    pub msgh_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgOp {
    Send(MsgEndpoint),
    Recv(MsgEndpoint),
    Free,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MsgState {
    Uninitialized,
    Send(MsgEndpoint),
    Recv(MsgEndpoint),
    Free,
}

/// Committed message with whichever halves were observed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MachineMachMsg {
    pub kmsg: u64,
    pub send: Option<MsgEndpoint>,
    pub recv: Option<MsgEndpoint>,
}

impl MachineMachMsg {
    pub fn msgh_id(&self) -> u32 {
        self.send.or(self.recv).map_or(0, |e| e.msgh_id)
    }

    pub fn is_complete(&self) -> bool {
        self.send.is_some() && self.recv.is_some()
    }

    /// Time between send and receive, when both halves were seen.
    pub fn latency(&self) -> Option<u64> {
        match (self.send, self.recv) {
            (Some(send), Some(recv)) => Some(recv.time - send.time),
            _ => None,
        }
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &MsgEndpoint> {
        self.send.iter().chain(self.recv.iter())
    }
}

#[derive(Debug, Clone)]
pub struct NurseryMachMsg {
    kmsg: u64,
    state: MsgState,
}

impl NurseryMachMsg {
    pub fn new(kmsg: u64) -> Self {
        Self {
            kmsg,
            state: MsgState::Uninitialized,
        }
    }

    pub fn kmsg(&self) -> u64 {
        self.kmsg
    }

    fn commit(&self, send: Option<MsgEndpoint>, recv: Option<MsgEndpoint>) -> MachineMachMsg {
        MachineMachMsg {
            kmsg: self.kmsg,
            send,
            recv,
        }
    }

    /// Apply one record. Returns a message when one has been completed.
    ///
    /// On error the state is left unchanged.
    pub fn transition(&mut self, op: MsgOp) -> Result<Option<MachineMachMsg>, MsgTransitionError> {
        let (next, committed) = match (self.state, op) {
            (MsgState::Send(_), MsgOp::Send(second)) => {
                return Err(MsgTransitionError::DoubleSend {
                    kmsg: self.kmsg,
                    event_index: second.event_index,
                })
            }
            (MsgState::Recv(_), MsgOp::Recv(second)) => {
                return Err(MsgTransitionError::DoubleRecv {
                    kmsg: self.kmsg,
                    event_index: second.event_index,
                })
            }
            (MsgState::Uninitialized | MsgState::Free, MsgOp::Send(send)) => {
                (MsgState::Send(send), None)
            }
            (MsgState::Uninitialized | MsgState::Free, MsgOp::Recv(recv)) => {
                (MsgState::Recv(recv), None)
            }
            (MsgState::Uninitialized | MsgState::Free, MsgOp::Free) => (MsgState::Free, None),
            (MsgState::Send(send), MsgOp::Recv(recv)) => {
                (MsgState::Free, Some(self.commit(Some(send), Some(recv))))
            }
            (MsgState::Send(send), MsgOp::Free) => {
                (MsgState::Free, Some(self.commit(Some(send), None)))
            }
            (MsgState::Recv(recv), MsgOp::Free) => {
                (MsgState::Free, Some(self.commit(None, Some(recv))))
            }
            // Buffer reused for a new message before its free was traced.
            (MsgState::Recv(recv), MsgOp::Send(send)) => {
                (MsgState::Send(send), Some(self.commit(None, Some(recv))))
            }
        };
        self.state = next;
        Ok(committed)
    }

    /// Commit whatever half is pending at the end of the trace.
    pub fn finish(&self) -> Option<MachineMachMsg> {
        match self.state {
            MsgState::Send(send) => Some(self.commit(Some(send), None)),
            MsgState::Recv(recv) => Some(self.commit(None, Some(recv))),
            MsgState::Uninitialized | MsgState::Free => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.state, MsgState::Send(_) | MsgState::Recv(_))
    }

    /// Rewrite thread handles of pending halves for the next generation.
    pub(crate) fn remap_threads<F>(&mut self, remap: F)
    where
        F: Fn(ThreadHandle) -> Option<ThreadHandle>,
    {
        match &mut self.state {
            MsgState::Send(endpoint) | MsgState::Recv(endpoint) => {
                endpoint.thread = endpoint.thread.and_then(&remap);
            }
            MsgState::Uninitialized | MsgState::Free => {}
        }
    }
}

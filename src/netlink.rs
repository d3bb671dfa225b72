// Copyright (c) 2024 The ltp-runtime Authors. Licensed under Apache License, Version 2.0.

//! `NETLINK_ROUTE` request/response builder.
//!
//! A [`NetlinkContext`] owns one `AF_NETLINK` socket and a growable scratch buffer
//! messages are assembled into. Attribute nesting is expressed as an explicit slice of
//! child attributes rather than the reference's "remember an offset, patch its length
//! in later" trick — the offset-patching still happens internally, but callers never
//! see a raw offset, only [`NetlinkContext::add_attr_list`] taking a closure.

use std::mem::size_of;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::time::Duration;

use nix::sys::socket::{self, AddressFamily, NetlinkAddr, SockFlag, SockType};

const NLMSG_ALIGNTO: usize = 4;
const NLMSG_HDRLEN: usize = size_of::<libc::nlmsghdr>();
const RTA_ALIGNTO: usize = 4;
const RTA_HDRLEN: usize = size_of::<libc::rtattr>();

const NLM_F_REQUEST: u16 = 0x01;
const NLM_F_MULTI: u16 = 0x02;
const NLM_F_ACK: u16 = 0x04;
const NLMSG_DONE: u16 = 3;
const NLMSG_ERROR: u16 = 2;

fn align(len: usize, to: usize) -> usize {
    (len + to - 1) & !(to - 1)
}

#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum NetlinkError {
    #[error("failed to create netlink socket")]
    #[diagnostic(code(ltp_runtime::netlink::socket))]
    Socket(#[source] nix::Error),

    #[error("failed to bind netlink socket")]
    #[diagnostic(code(ltp_runtime::netlink::bind))]
    Bind(#[source] nix::Error),

    #[error("netlink send failed")]
    #[diagnostic(code(ltp_runtime::netlink::send))]
    Send(#[source] nix::Error),

    #[error("netlink recv failed")]
    #[diagnostic(code(ltp_runtime::netlink::recv))]
    Recv(#[source] nix::Error),

    #[error("timed out waiting for a netlink reply")]
    #[diagnostic(code(ltp_runtime::netlink::timeout))]
    Timeout,

    #[error("kernel rejected request (errno {0})")]
    #[diagnostic(code(ltp_runtime::netlink::ack_error))]
    AckError(i32),

    #[error("attribute payload of {len} bytes exceeds the 16-bit rtattr length field")]
    #[diagnostic(code(ltp_runtime::netlink::attr_too_long))]
    AttrTooLong { len: usize },

    #[error("no message is open for attributes")]
    #[diagnostic(code(ltp_runtime::netlink::no_open_message))]
    NoOpenMessage,

    #[error("NLMSG_ERROR carried sequence {got}, expected {expected}")]
    #[diagnostic(code(ltp_runtime::netlink::unexpected_ack_seq))]
    UnexpectedAckSeq { expected: u32, got: u32 },
}

/// One decoded reply record: its header fields plus the raw payload after the header
/// (attributes are intentionally left raw — callers who need attributes reuse
/// [`NetlinkContext::add_attr`]'s inverse by hand, since each request's expected
/// attribute set is request-specific).
#[derive(Debug, Clone)]
pub struct Message {
    pub msg_type: u16,
    pub flags: u16,
    pub seq: u32,
    pub payload: Vec<u8>,
}

/// A growable `nlmsghdr`-framed request buffer bound to one netlink socket.
pub struct NetlinkContext {
    socket: OwnedFd,
    seq: u32,
    buf: Vec<u8>,
    /// Byte offset of the message currently being built, if any.
    cur: Option<usize>,
    /// Stack of byte offsets of `RTA_HDRLEN`-sized headers awaiting a length patch,
    /// pushed by `add_attr_list` and popped when its closure returns.
    attr_stack: Vec<usize>,
    /// Sequence numbers of messages in the current batch that requested `NLM_F_ACK`,
    /// in send order; `check_acks` matches incoming `NLMSG_ERROR` records against this
    /// forward-only, the same order the kernel replies in.
    pending_acks: Vec<u32>,
}

impl NetlinkContext {
    /// Open an `AF_NETLINK`/`NETLINK_ROUTE` socket and bind it to an auto-assigned
    /// port, the same setup `tst_rtnl_create_context` performs.
    pub fn create() -> Result<Self, NetlinkError> {
        let socket = socket::socket(
            AddressFamily::Netlink,
            SockType::Datagram,
            SockFlag::SOCK_CLOEXEC,
            Some(socket::SockProtocol::NetlinkRoute),
        )
        .map_err(NetlinkError::Socket)?;

        let addr = NetlinkAddr::new(0, 0);
        socket::bind(socket.as_raw_fd(), &addr).map_err(NetlinkError::Bind)?;

        Ok(NetlinkContext {
            socket,
            seq: 0,
            buf: Vec::with_capacity(1024),
            cur: None,
            attr_stack: Vec::new(),
            pending_acks: Vec::new(),
        })
    }

    fn cur_hdr_mut(&mut self) -> Result<&mut libc::nlmsghdr, NetlinkError> {
        let off = self.cur.ok_or(NetlinkError::NoOpenMessage)?;
        // SAFETY: `off` always points at an `NLMSG_HDRLEN`-sized, correctly aligned
        // header written by `add_message`, and the backing Vec never shrinks below it
        // while the message is open.
        Ok(unsafe { &mut *(self.buf.as_mut_ptr().add(off).cast::<libc::nlmsghdr>()) })
    }

    /// Start a new message in the batch, filling in sequence number and
    /// `NLM_F_REQUEST`. When `multi` is set the previous message (if any) is marked
    /// `NLM_F_MULTI`, mirroring the reference's "only the messages before the last one
    /// in a batch are flagged multi" bookkeeping.
    pub fn add_message(&mut self, msg_type: u16, flags: u16, multi: bool) -> Result<(), NetlinkError> {
        if multi {
            if let Some(prev) = self.cur {
                // SAFETY: see `cur_hdr_mut`.
                let hdr = unsafe { &mut *(self.buf.as_mut_ptr().add(prev).cast::<libc::nlmsghdr>()) };
                hdr.nlmsg_flags |= NLM_F_MULTI;
            }
        }

        let off = align(self.buf.len(), NLMSG_ALIGNTO);
        self.buf.resize(off + NLMSG_HDRLEN, 0);
        self.seq += 1;

        let hdr = libc::nlmsghdr {
            nlmsg_len: NLMSG_HDRLEN as u32,
            nlmsg_type: msg_type,
            nlmsg_flags: flags | NLM_F_REQUEST,
            nlmsg_seq: self.seq,
            nlmsg_pid: 0,
        };
        // SAFETY: `off..off+NLMSG_HDRLEN` was just reserved above.
        unsafe {
            std::ptr::write(self.buf.as_mut_ptr().add(off).cast::<libc::nlmsghdr>(), hdr);
        }

        self.cur = Some(off);
        if flags & NLM_F_ACK != 0 {
            self.pending_acks.push(self.seq);
        }
        Ok(())
    }

    fn grow_cur_len(&mut self, extra: usize) -> Result<(), NetlinkError> {
        let hdr = self.cur_hdr_mut()?;
        hdr.nlmsg_len += extra as u32;
        Ok(())
    }

    fn append_payload(&mut self, bytes: &[u8]) {
        let padded = align(bytes.len(), NLMSG_ALIGNTO);
        self.buf.extend_from_slice(bytes);
        self.buf.resize(self.buf.len() + (padded - bytes.len()), 0);
    }

    /// Append a typed attribute with a raw payload to the currently open message (or
    /// the innermost open attribute list).
    pub fn add_attr(&mut self, attr_type: u16, payload: &[u8]) -> Result<(), NetlinkError> {
        self.cur.ok_or(NetlinkError::NoOpenMessage)?;
        let total = RTA_HDRLEN + payload.len();
        if total > usize::from(u16::MAX) {
            return Err(NetlinkError::AttrTooLong { len: total });
        }

        let rta = libc::rtattr { rta_len: total as u16, rta_type: attr_type };
        let mut bytes = Vec::with_capacity(align(total, RTA_ALIGNTO));
        bytes.extend_from_slice(unsafe {
            std::slice::from_raw_parts((&raw const rta).cast::<u8>(), RTA_HDRLEN)
        });
        bytes.extend_from_slice(payload);

        let padded_len = align(total, NLMSG_ALIGNTO);
        self.append_payload(&bytes);
        self.grow_cur_len(padded_len)?;

        if let Some(&outer) = self.attr_stack.last() {
            // SAFETY: `outer` was written by `add_attr_list` below as an RTA_HDRLEN
            // header and is still inside the live buffer.
            let outer_rta = unsafe { &mut *(self.buf.as_mut_ptr().add(outer).cast::<libc::rtattr>()) };
            outer_rta.rta_len += padded_len as u16;
        }

        Ok(())
    }

    /// A convenience over [`NetlinkContext::add_attr`] for a NUL-terminated string
    /// attribute.
    pub fn add_attr_string(&mut self, attr_type: u16, value: &str) -> Result<(), NetlinkError> {
        let mut bytes = value.as_bytes().to_vec();
        bytes.push(0);
        self.add_attr(attr_type, &bytes)
    }

    /// Open a nested attribute list, run `body` to populate it with further
    /// `add_attr`/`add_attr_list` calls, then patch its length once `body` returns.
    /// This replaces the reference's "remember the offset, come back and patch it"
    /// idiom with RAII-shaped nesting the borrow checker can verify is balanced.
    pub fn add_attr_list(
        &mut self,
        attr_type: u16,
        body: impl FnOnce(&mut Self) -> Result<(), NetlinkError>,
    ) -> Result<(), NetlinkError> {
        self.cur.ok_or(NetlinkError::NoOpenMessage)?;
        let off = self.buf.len();

        let rta = libc::rtattr { rta_len: RTA_HDRLEN as u16, rta_type: attr_type };
        let bytes =
            unsafe { std::slice::from_raw_parts((&raw const rta).cast::<u8>(), RTA_HDRLEN) }.to_vec();
        self.append_payload(&bytes);
        self.grow_cur_len(align(RTA_HDRLEN, NLMSG_ALIGNTO))?;

        if let Some(&outer) = self.attr_stack.last() {
            let outer_rta = unsafe { &mut *(self.buf.as_mut_ptr().add(outer).cast::<libc::rtattr>()) };
            outer_rta.rta_len += align(RTA_HDRLEN, NLMSG_ALIGNTO) as u16;
        }

        self.attr_stack.push(off);
        let result = body(self);
        self.attr_stack.pop();
        result
    }

    /// Send every message accumulated since the last `send_validate`, synthesizing a
    /// trailing `NLMSG_DONE` if the last message was flagged `NLM_F_MULTI`.
    fn send(&mut self) -> Result<(), NetlinkError> {
        if let Some(off) = self.cur {
            // SAFETY: see `cur_hdr_mut`.
            let hdr = unsafe { &*(self.buf.as_ptr().add(off).cast::<libc::nlmsghdr>()) };
            if hdr.nlmsg_flags & NLM_F_MULTI != 0 {
                self.add_message(NLMSG_DONE, NLM_F_MULTI, false)?;
            }
        }

        socket::send(self.socket.as_raw_fd(), &self.buf, socket::MsgFlags::empty())
            .map_err(NetlinkError::Send)?;
        Ok(())
    }

    fn wait_readable(&self, timeout: Duration) -> Result<bool, NetlinkError> {
        use nix::poll::{PollFd, PollFlags, PollTimeout};
        let mut fds = [PollFd::new(self.socket.as_fd(), PollFlags::POLLIN)];
        let ms = u16::try_from(timeout.as_millis().min(u128::from(u16::MAX))).unwrap_or(u16::MAX);
        let n = nix::poll::poll(&mut fds, PollTimeout::from(ms)).map_err(NetlinkError::Recv)?;
        Ok(n > 0)
    }

    fn recv(&mut self) -> Result<Vec<Message>, NetlinkError> {
        let mut raw = vec![0u8; 16 * 1024];
        let n = socket::recv(self.socket.as_raw_fd(), &mut raw, socket::MsgFlags::empty())
            .map_err(NetlinkError::Recv)?;
        raw.truncate(n);

        let mut out = Vec::new();
        let mut off = 0;
        while off + NLMSG_HDRLEN <= raw.len() {
            // SAFETY: bounds checked above; nlmsghdr has no alignment requirements
            // beyond 4 bytes and the kernel always emits aligned records.
            let hdr = unsafe { std::ptr::read_unaligned(raw.as_ptr().add(off).cast::<libc::nlmsghdr>()) };
            let msg_len = hdr.nlmsg_len as usize;
            if msg_len < NLMSG_HDRLEN || off + msg_len > raw.len() {
                break;
            }
            let payload = raw[off + NLMSG_HDRLEN..off + msg_len].to_vec();
            out.push(Message {
                msg_type: hdr.nlmsg_type,
                flags: hdr.nlmsg_flags,
                seq: hdr.nlmsg_seq,
                payload,
            });
            if hdr.nlmsg_type == NLMSG_DONE {
                break;
            }
            off += align(msg_len, NLMSG_ALIGNTO);
        }
        Ok(out)
    }

    /// Scan replies for `NLMSG_ERROR` records, matching each against the next
    /// outstanding sent sequence number in `pending_acks`, forward-only (a reply for an
    /// already-passed sequence number is never re-checked). A batch of K `NLM_F_ACK`
    /// messages is expected to come back as K `NLMSG_ERROR` records with sequence
    /// `initial_seq`..`initial_seq + K - 1`, in that order; anything else — an
    /// unexpected or out-of-order sequence — is itself an error rather than being
    /// silently accepted as belonging to whichever message is still outstanding.
    fn check_acks(&self, replies: &[Message]) -> Result<(), NetlinkError> {
        let mut next = 0usize;
        for m in replies {
            if m.msg_type != NLMSG_ERROR {
                continue;
            }
            let Some(&expected) = self.pending_acks.get(next) else {
                return Err(NetlinkError::UnexpectedAckSeq { expected: 0, got: m.seq });
            };
            if m.seq != expected {
                return Err(NetlinkError::UnexpectedAckSeq { expected, got: m.seq });
            }
            next += 1;

            let errno = if m.payload.len() >= 4 {
                i32::from_ne_bytes(m.payload[0..4].try_into().unwrap())
            } else {
                0
            };
            if errno != 0 {
                return Err(NetlinkError::AckError(-errno));
            }
        }
        Ok(())
    }

    /// Send the accumulated batch (requesting `NLM_F_ACK` is the caller's
    /// responsibility via `add_message`'s `flags`), wait up to one second, collect
    /// replies, validate there were no `NLMSG_ERROR` records, then reset the buffer for
    /// the next batch.
    pub fn send_validate(&mut self) -> Result<Vec<Message>, NetlinkError> {
        self.send()?;

        if !self.wait_readable(Duration::from_secs(1))? {
            return Err(NetlinkError::Timeout);
        }
        let replies = self.recv()?;
        self.check_acks(&replies)?;

        self.buf.clear();
        self.cur = None;
        self.attr_stack.clear();
        self.pending_acks.clear();
        Ok(replies)
    }
}

impl std::fmt::Debug for NetlinkContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetlinkContext").field("seq", &self.seq).field("buflen", &self.buf.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_rounds_up_to_multiple() {
        assert_eq!(align(0, 4), 0);
        assert_eq!(align(1, 4), 4);
        assert_eq!(align(4, 4), 4);
        assert_eq!(align(5, 4), 8);
    }

    // Socket creation requires CAP_NET_RAW-equivalent privilege in some sandboxes, so
    // the message-building logic is covered directly through its buffer layout rather
    // than through `NetlinkContext::create`.
    #[test]
    fn nlmsghdr_size_matches_kernel_abi() {
        assert_eq!(NLMSG_HDRLEN, 16);
        assert_eq!(RTA_HDRLEN, 4);
    }

    /// §8's netlink invariant: a nested attribute list's reported length equals
    /// `RTA_LENGTH(0) + S` where `S` is the total size of its descendants. Socket
    /// creation is sidestepped with a throwaway pipe fd, since nothing here sends.
    #[test]
    fn nested_attr_list_patches_parent_length() {
        let (dummy_r, _dummy_w) = nix::unistd::pipe().unwrap();
        let mut ctx = NetlinkContext {
            socket: dummy_r,
            seq: 0,
            buf: Vec::new(),
            cur: None,
            attr_stack: Vec::new(),
            pending_acks: Vec::new(),
        };

        ctx.add_message(0, 0, false).unwrap();
        let list_off = ctx.buf.len();
        ctx.add_attr_list(1, |inner| {
            inner.add_attr(2, &[0u8; 4])?;
            inner.add_attr(3, &[0u8; 4])?;
            Ok(())
        })
        .unwrap();

        let rta_len = u16::from_ne_bytes(ctx.buf[list_off..list_off + 2].try_into().unwrap());
        let s = 2 * (RTA_HDRLEN + 4); // two children, each RTA_LENGTH(4), already aligned
        assert_eq!(rta_len as usize, RTA_HDRLEN + s);
    }

    fn dummy_ctx() -> NetlinkContext {
        let (dummy_r, _dummy_w) = nix::unistd::pipe().unwrap();
        NetlinkContext {
            socket: dummy_r,
            seq: 0,
            buf: Vec::new(),
            cur: None,
            attr_stack: Vec::new(),
            pending_acks: Vec::new(),
        }
    }

    fn err_message(seq: u32, errno: i32) -> Message {
        Message { msg_type: NLMSG_ERROR, flags: 0, seq, payload: errno.to_ne_bytes().to_vec() }
    }

    #[test]
    fn check_acks_matches_kth_reply_to_initial_seq_plus_k_minus_1() {
        let mut ctx = dummy_ctx();
        for _ in 0..3 {
            ctx.add_message(0, NLM_F_ACK, false).unwrap();
        }
        assert_eq!(ctx.pending_acks, vec![1, 2, 3]);

        let replies = vec![err_message(1, 0), err_message(2, 0), err_message(3, 0)];
        assert!(ctx.check_acks(&replies).is_ok());
    }

    #[test]
    fn check_acks_rejects_mismatched_sequence() {
        let mut ctx = dummy_ctx();
        ctx.add_message(0, NLM_F_ACK, false).unwrap();

        let replies = vec![err_message(99, 0)];
        let err = ctx.check_acks(&replies).unwrap_err();
        assert!(matches!(err, NetlinkError::UnexpectedAckSeq { expected: 1, got: 99 }));
    }

    #[test]
    fn check_acks_rejects_nonzero_errno_for_matching_sequence() {
        let mut ctx = dummy_ctx();
        ctx.add_message(0, NLM_F_ACK, false).unwrap();

        let replies = vec![err_message(1, -2)];
        let err = ctx.check_acks(&replies).unwrap_err();
        assert!(matches!(err, NetlinkError::AckError(2)));
    }
}

//! Frame codec for the Copycat wire protocol.
//!
//! Every message crosses the wire as a framed envelope:
//!
//! ```text
//! +-----------+--------+------------------+----------+
//! |  Length   |  Type  |  Correlation ID  |   Body   |
//! | (4 bytes) | (1 b)  |    (8 bytes)     | (N bytes)|
//! +-----------+--------+------------------+----------+
//! ```
//!
//! Length excludes its own four bytes. The correlation id pairs responses
//! with their requests on a shared connection. All integers are
//! little-endian.
//!
//! # Type ids
//!
//! 1/2 append request/response, 3/4 vote, 5/6 poll, 7/8 sync, 9/10
//! submit, 11 status response, 12 status request.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use copycat_core::limits::MESSAGE_SIZE_BYTES_MAX;
use copycat_core::{LogIndex, MemberId, TermId};
use copycat_log::{Entry, EntryKind};
use copycat_raft::{
    AppendRequest, AppendResponse, Consistency, Member, MemberKind, Operation, PollRequest,
    PollResponse, RaftErrorKind, Request, Response, Status, StatusRequest, StatusResponse,
    SubmitRequest, SubmitResponse, SyncRequest, SyncResponse, VoteRequest, VoteResponse,
};
use thiserror::Error;

const TAG_APPEND_REQUEST: u8 = 1;
const TAG_APPEND_RESPONSE: u8 = 2;
const TAG_VOTE_REQUEST: u8 = 3;
const TAG_VOTE_RESPONSE: u8 = 4;
const TAG_POLL_REQUEST: u8 = 5;
const TAG_POLL_RESPONSE: u8 = 6;
const TAG_SYNC_REQUEST: u8 = 7;
const TAG_SYNC_RESPONSE: u8 = 8;
const TAG_SUBMIT_REQUEST: u8 = 9;
const TAG_SUBMIT_RESPONSE: u8 = 10;
const TAG_STATUS_RESPONSE: u8 = 11;
const TAG_STATUS_REQUEST: u8 = 12;

const OP_COMMAND: u8 = 0;
const OP_QUERY: u8 = 1;

/// Codec errors.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Frame exceeds the maximum allowed size.
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge {
        /// Actual size.
        size: u64,
        /// Maximum allowed.
        max: u32,
    },

    /// Unknown frame type id.
    #[error("unknown frame type: {tag}")]
    UnknownFrameType {
        /// The unknown tag value.
        tag: u8,
    },

    /// A field failed to decode.
    #[error("malformed frame: {reason}")]
    Malformed {
        /// What was malformed.
        reason: &'static str,
    },
}

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A request envelope.
    Request {
        /// Correlation id to echo in the response.
        correlation_id: u64,
        /// The request body.
        request: Request,
    },
    /// A response envelope.
    Response {
        /// Correlation id of the originating request.
        correlation_id: u64,
        /// The response body.
        response: Response,
    },
}

/// Encodes a request envelope.
///
/// # Errors
/// Returns an error if the frame exceeds the size cap.
pub fn encode_request(correlation_id: u64, request: &Request) -> CodecResult<Bytes> {
    let mut buf = BytesMut::with_capacity(256);
    buf.put_u32_le(0);

    match request {
        Request::Append(r) => {
            buf.put_u8(TAG_APPEND_REQUEST);
            buf.put_u64_le(correlation_id);
            encode_append_request(&mut buf, r);
        }
        Request::Vote(r) => {
            buf.put_u8(TAG_VOTE_REQUEST);
            buf.put_u64_le(correlation_id);
            encode_vote_shape(&mut buf, r.term, r.candidate, r.last_log_index, r.last_log_term);
        }
        Request::Poll(r) => {
            buf.put_u8(TAG_POLL_REQUEST);
            buf.put_u64_le(correlation_id);
            encode_vote_shape(&mut buf, r.term, r.candidate, r.last_log_index, r.last_log_term);
        }
        Request::Sync(r) => {
            buf.put_u8(TAG_SYNC_REQUEST);
            buf.put_u64_le(correlation_id);
            encode_sync_request(&mut buf, r);
        }
        Request::Submit(r) => {
            buf.put_u8(TAG_SUBMIT_REQUEST);
            buf.put_u64_le(correlation_id);
            encode_operation(&mut buf, &r.operation);
        }
        Request::Status(StatusRequest) => {
            buf.put_u8(TAG_STATUS_REQUEST);
            buf.put_u64_le(correlation_id);
        }
    }

    finish_frame(buf)
}

/// Encodes a response envelope.
///
/// # Errors
/// Returns an error if the frame exceeds the size cap.
pub fn encode_response(correlation_id: u64, response: &Response) -> CodecResult<Bytes> {
    let mut buf = BytesMut::with_capacity(64);
    buf.put_u32_le(0);

    match response {
        Response::Append(r) => {
            buf.put_u8(TAG_APPEND_RESPONSE);
            buf.put_u64_le(correlation_id);
            encode_status(&mut buf, r.status, r.error);
            if r.status == Status::Ok {
                buf.put_u64_le(r.term.get());
                buf.put_u8(u8::from(r.succeeded));
                buf.put_u64_le(r.log_index.get());
            }
        }
        Response::Vote(r) => {
            buf.put_u8(TAG_VOTE_RESPONSE);
            buf.put_u64_le(correlation_id);
            encode_status(&mut buf, r.status, r.error);
            if r.status == Status::Ok {
                buf.put_u64_le(r.term.get());
                buf.put_u8(u8::from(r.granted));
            }
        }
        Response::Poll(r) => {
            buf.put_u8(TAG_POLL_RESPONSE);
            buf.put_u64_le(correlation_id);
            encode_status(&mut buf, r.status, r.error);
            if r.status == Status::Ok {
                buf.put_u64_le(r.term.get());
                buf.put_u8(u8::from(r.granted));
            }
        }
        Response::Sync(r) => {
            buf.put_u8(TAG_SYNC_RESPONSE);
            buf.put_u64_le(correlation_id);
            encode_status(&mut buf, r.status, r.error);
            if r.status == Status::Ok {
                encode_members(&mut buf, &r.members);
            }
        }
        Response::Submit(r) => {
            buf.put_u8(TAG_SUBMIT_RESPONSE);
            buf.put_u64_le(correlation_id);
            buf.put_u8(r.status.as_u8());
            if r.status == Status::Ok {
                encode_opt_bytes(&mut buf, r.result.as_ref());
            } else {
                buf.put_u8(r.error.map_or(0, RaftErrorKind::as_u8));
            }
            encode_opt_member_id(&mut buf, r.leader);
        }
        Response::Status(r) => {
            buf.put_u8(TAG_STATUS_RESPONSE);
            buf.put_u64_le(correlation_id);
            encode_status(&mut buf, r.status, r.error);
            if r.status == Status::Ok {
                buf.put_u64_le(r.term.get());
                encode_opt_member_id(&mut buf, r.leader);
            }
        }
    }

    finish_frame(buf)
}

/// Decodes one frame from the front of `data`.
///
/// Returns `None` when `data` does not yet hold a complete frame, or the
/// frame plus the number of bytes consumed.
///
/// # Errors
/// Returns an error on oversized, unknown, or malformed frames.
pub fn decode_frame(data: &[u8]) -> CodecResult<Option<(Frame, usize)>> {
    if data.len() < 4 {
        return Ok(None);
    }
    let length = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    if length > MESSAGE_SIZE_BYTES_MAX {
        return Err(CodecError::MessageTooLarge {
            size: u64::from(length),
            max: MESSAGE_SIZE_BYTES_MAX,
        });
    }
    let total = 4 + length as usize;
    if data.len() < total {
        return Ok(None);
    }

    let mut body = &data[4..total];
    if body.remaining() < 9 {
        return Err(CodecError::Malformed {
            reason: "frame shorter than envelope header",
        });
    }
    let tag = body.get_u8();
    let correlation_id = body.get_u64_le();

    let frame = match tag {
        TAG_APPEND_REQUEST => Frame::Request {
            correlation_id,
            request: Request::Append(decode_append_request(&mut body)?),
        },
        TAG_VOTE_REQUEST => {
            let (term, candidate, last_log_index, last_log_term) = decode_vote_shape(&mut body)?;
            Frame::Request {
                correlation_id,
                request: Request::Vote(VoteRequest {
                    term,
                    candidate,
                    last_log_index,
                    last_log_term,
                }),
            }
        }
        TAG_POLL_REQUEST => {
            let (term, candidate, last_log_index, last_log_term) = decode_vote_shape(&mut body)?;
            Frame::Request {
                correlation_id,
                request: Request::Poll(PollRequest {
                    term,
                    candidate,
                    last_log_index,
                    last_log_term,
                }),
            }
        }
        TAG_SYNC_REQUEST => Frame::Request {
            correlation_id,
            request: Request::Sync(decode_sync_request(&mut body)?),
        },
        TAG_SUBMIT_REQUEST => Frame::Request {
            correlation_id,
            request: Request::Submit(SubmitRequest {
                operation: decode_operation(&mut body)?,
            }),
        },
        TAG_STATUS_REQUEST => Frame::Request {
            correlation_id,
            request: Request::Status(StatusRequest),
        },
        TAG_APPEND_RESPONSE => {
            let (status, error) = decode_status(&mut body)?;
            let response = if status == Status::Ok {
                ensure(&body, 17, "append response body")?;
                let term = TermId::new(body.get_u64_le());
                let succeeded = body.get_u8() != 0;
                let log_index = LogIndex::new(body.get_u64_le());
                AppendResponse::ok(term, succeeded, log_index)
            } else {
                AppendResponse::error(
                    error.unwrap_or(RaftErrorKind::IllegalMemberState),
                    TermId::new(0),
                )
            };
            Frame::Response {
                correlation_id,
                response: Response::Append(response),
            }
        }
        TAG_VOTE_RESPONSE => {
            let (status, error) = decode_status(&mut body)?;
            let response = if status == Status::Ok {
                ensure(&body, 9, "vote response body")?;
                let term = TermId::new(body.get_u64_le());
                let granted = body.get_u8() != 0;
                VoteResponse::ok(term, granted)
            } else {
                VoteResponse::error(
                    error.unwrap_or(RaftErrorKind::IllegalMemberState),
                    TermId::new(0),
                )
            };
            Frame::Response {
                correlation_id,
                response: Response::Vote(response),
            }
        }
        TAG_POLL_RESPONSE => {
            let (status, error) = decode_status(&mut body)?;
            let response = if status == Status::Ok {
                ensure(&body, 9, "poll response body")?;
                let term = TermId::new(body.get_u64_le());
                let granted = body.get_u8() != 0;
                PollResponse::ok(term, granted)
            } else {
                PollResponse::error(
                    error.unwrap_or(RaftErrorKind::IllegalMemberState),
                    TermId::new(0),
                )
            };
            Frame::Response {
                correlation_id,
                response: Response::Poll(response),
            }
        }
        TAG_SYNC_RESPONSE => {
            let (status, error) = decode_status(&mut body)?;
            let response = if status == Status::Ok {
                SyncResponse::ok(decode_members(&mut body)?)
            } else {
                SyncResponse::error(error.unwrap_or(RaftErrorKind::IllegalMemberState))
            };
            Frame::Response {
                correlation_id,
                response: Response::Sync(response),
            }
        }
        TAG_SUBMIT_RESPONSE => {
            ensure(&body, 1, "submit response status")?;
            let status = Status::from_u8(body.get_u8()).ok_or(CodecError::Malformed {
                reason: "bad status byte",
            })?;
            let (result, error) = if status == Status::Ok {
                (decode_opt_bytes(&mut body)?, None)
            } else {
                ensure(&body, 1, "submit response error")?;
                (None, RaftErrorKind::from_u8(body.get_u8()))
            };
            let leader = decode_opt_member_id(&mut body)?;
            let response = SubmitResponse {
                status,
                error,
                result,
                leader,
            };
            Frame::Response {
                correlation_id,
                response: Response::Submit(response),
            }
        }
        TAG_STATUS_RESPONSE => {
            let (status, error) = decode_status(&mut body)?;
            let response = if status == Status::Ok {
                ensure(&body, 8, "status response body")?;
                let term = TermId::new(body.get_u64_le());
                let leader = decode_opt_member_id(&mut body)?;
                StatusResponse::ok(term, leader)
            } else {
                StatusResponse {
                    status,
                    error,
                    term: TermId::new(0),
                    leader: None,
                }
            };
            Frame::Response {
                correlation_id,
                response: Response::Status(response),
            }
        }
        tag => return Err(CodecError::UnknownFrameType { tag }),
    };

    Ok(Some((frame, total)))
}

fn finish_frame(mut buf: BytesMut) -> CodecResult<Bytes> {
    let length = buf.len() as u64 - 4;
    if length > u64::from(MESSAGE_SIZE_BYTES_MAX) {
        return Err(CodecError::MessageTooLarge {
            size: length,
            max: MESSAGE_SIZE_BYTES_MAX,
        });
    }
    // Safe cast: bounded by the message size cap just checked.
    #[allow(clippy::cast_possible_truncation)]
    let length = length as u32;
    buf[0..4].copy_from_slice(&length.to_le_bytes());
    Ok(buf.freeze())
}

fn encode_status(buf: &mut BytesMut, status: Status, error: Option<RaftErrorKind>) {
    buf.put_u8(status.as_u8());
    if status == Status::Error {
        buf.put_u8(error.map_or(0, RaftErrorKind::as_u8));
    }
}

fn decode_status(body: &mut &[u8]) -> CodecResult<(Status, Option<RaftErrorKind>)> {
    ensure(body, 1, "status byte")?;
    let status = Status::from_u8(body.get_u8()).ok_or(CodecError::Malformed {
        reason: "bad status byte",
    })?;
    if status == Status::Error {
        ensure(body, 1, "error byte")?;
        Ok((status, RaftErrorKind::from_u8(body.get_u8())))
    } else {
        Ok((status, None))
    }
}

fn encode_append_request(buf: &mut BytesMut, request: &AppendRequest) {
    buf.put_u64_le(request.term.get());
    buf.put_u32_le(request.leader.get());
    buf.put_u64_le(request.prev_log_index.get());
    buf.put_u64_le(request.prev_log_term.get());
    encode_entries(buf, &request.entries);
    buf.put_u64_le(request.commit_index.get());
}

fn decode_append_request(body: &mut &[u8]) -> CodecResult<AppendRequest> {
    ensure(body, 28, "append request header")?;
    let term = TermId::new(body.get_u64_le());
    let leader = MemberId::new(body.get_u32_le());
    let prev_log_index = LogIndex::new(body.get_u64_le());
    let prev_log_term = TermId::new(body.get_u64_le());
    let entries = decode_entries(body)?;
    ensure(body, 8, "append request commit index")?;
    let commit_index = LogIndex::new(body.get_u64_le());
    Ok(AppendRequest {
        term,
        leader,
        prev_log_index,
        prev_log_term,
        entries,
        commit_index,
    })
}

fn encode_vote_shape(
    buf: &mut BytesMut,
    term: TermId,
    candidate: MemberId,
    last_log_index: LogIndex,
    last_log_term: TermId,
) {
    buf.put_u64_le(term.get());
    buf.put_u32_le(candidate.get());
    buf.put_u64_le(last_log_index.get());
    buf.put_u64_le(last_log_term.get());
}

fn decode_vote_shape(body: &mut &[u8]) -> CodecResult<(TermId, MemberId, LogIndex, TermId)> {
    ensure(body, 28, "vote request body")?;
    Ok((
        TermId::new(body.get_u64_le()),
        MemberId::new(body.get_u32_le()),
        LogIndex::new(body.get_u64_le()),
        TermId::new(body.get_u64_le()),
    ))
}

fn encode_sync_request(buf: &mut BytesMut, request: &SyncRequest) {
    buf.put_u64_le(request.term.get());
    encode_opt_member_id(buf, request.leader);
    buf.put_u64_le(request.log_index.get());
    encode_members(buf, &request.members);
    encode_entries(buf, &request.entries);
}

fn decode_sync_request(body: &mut &[u8]) -> CodecResult<SyncRequest> {
    ensure(body, 8, "sync request term")?;
    let term = TermId::new(body.get_u64_le());
    let leader = decode_opt_member_id(body)?;
    ensure(body, 8, "sync request log index")?;
    let log_index = LogIndex::new(body.get_u64_le());
    let members = decode_members(body)?;
    let entries = decode_entries(body)?;
    Ok(SyncRequest {
        term,
        leader,
        log_index,
        members,
        entries,
    })
}

fn encode_operation(buf: &mut BytesMut, operation: &Operation) {
    match operation {
        Operation::Command { key, payload } => {
            buf.put_u8(OP_COMMAND);
            encode_bytes(buf, key);
            encode_bytes(buf, payload);
        }
        Operation::Query {
            key,
            payload,
            consistency,
        } => {
            buf.put_u8(OP_QUERY);
            buf.put_u8(consistency.as_u8());
            encode_bytes(buf, key);
            encode_bytes(buf, payload);
        }
    }
}

fn decode_operation(body: &mut &[u8]) -> CodecResult<Operation> {
    ensure(body, 1, "operation tag")?;
    match body.get_u8() {
        OP_COMMAND => {
            let key = decode_bytes(body)?;
            let payload = decode_bytes(body)?;
            Ok(Operation::Command { key, payload })
        }
        OP_QUERY => {
            ensure(body, 1, "consistency byte")?;
            let consistency =
                Consistency::from_u8(body.get_u8()).ok_or(CodecError::Malformed {
                    reason: "bad consistency byte",
                })?;
            let key = decode_bytes(body)?;
            let payload = decode_bytes(body)?;
            Ok(Operation::Query {
                key,
                payload,
                consistency,
            })
        }
        _ => Err(CodecError::Malformed {
            reason: "bad operation tag",
        }),
    }
}

fn encode_entries(buf: &mut BytesMut, entries: &[Entry]) {
    // Safe cast: batch sizes are bounded well below u32.
    #[allow(clippy::cast_possible_truncation)]
    buf.put_u32_le(entries.len() as u32);
    for entry in entries {
        buf.put_u64_le(entry.index.get());
        buf.put_u64_le(entry.term.get());
        buf.put_u8(entry.kind.as_u8());
        buf.put_u64_le(entry.timestamp);
        encode_bytes(buf, &entry.key);
        encode_bytes(buf, &entry.payload);
    }
}

fn decode_entries(body: &mut &[u8]) -> CodecResult<Vec<Entry>> {
    ensure(body, 4, "entry count")?;
    let count = body.get_u32_le() as usize;
    let mut entries = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        ensure(body, 25, "entry header")?;
        let index = LogIndex::new(body.get_u64_le());
        let term = TermId::new(body.get_u64_le());
        let kind = EntryKind::from_u8(body.get_u8()).map_err(|_| CodecError::Malformed {
            reason: "bad entry kind",
        })?;
        let timestamp = body.get_u64_le();
        let key = decode_bytes(body)?;
        let payload = decode_bytes(body)?;
        let entry = Entry::new(index, term, kind, timestamp, key, payload).map_err(|_| {
            CodecError::Malformed {
                reason: "oversized entry",
            }
        })?;
        entries.push(entry);
    }
    Ok(entries)
}

fn encode_members(buf: &mut BytesMut, members: &[Member]) {
    // Safe cast: cluster size is bounded far below u32.
    #[allow(clippy::cast_possible_truncation)]
    buf.put_u32_le(members.len() as u32);
    for member in members {
        buf.put_u32_le(member.id.get());
        buf.put_u8(member.kind.as_u8());
        // Safe cast: addresses are short host:port strings.
        #[allow(clippy::cast_possible_truncation)]
        buf.put_u16_le(member.address.len() as u16);
        buf.put_slice(member.address.as_bytes());
        buf.put_u64_le(member.commit_index.get());
        buf.put_u64_le(member.recycle_index.get());
        buf.put_u64_le(member.version);
    }
}

fn decode_members(body: &mut &[u8]) -> CodecResult<Vec<Member>> {
    ensure(body, 4, "member count")?;
    let count = body.get_u32_le() as usize;
    let mut members = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        ensure(body, 7, "member header")?;
        let id = MemberId::new(body.get_u32_le());
        let kind = MemberKind::from_u8(body.get_u8()).ok_or(CodecError::Malformed {
            reason: "bad member kind",
        })?;
        let address_len = body.get_u16_le() as usize;
        ensure(body, address_len + 24, "member body")?;
        let address = std::str::from_utf8(&body[..address_len])
            .map_err(|_| CodecError::Malformed {
                reason: "member address not utf-8",
            })?
            .to_string();
        body.advance(address_len);
        let mut member = Member::new(id, kind, address);
        member.commit_index = LogIndex::new(body.get_u64_le());
        member.recycle_index = LogIndex::new(body.get_u64_le());
        member.version = body.get_u64_le();
        members.push(member);
    }
    Ok(members)
}

fn encode_bytes(buf: &mut BytesMut, data: &Bytes) {
    // Safe cast: entry fields are bounded by the entry size cap.
    #[allow(clippy::cast_possible_truncation)]
    buf.put_u32_le(data.len() as u32);
    buf.put_slice(data);
}

fn decode_bytes(body: &mut &[u8]) -> CodecResult<Bytes> {
    ensure(body, 4, "bytes length")?;
    let len = body.get_u32_le() as usize;
    ensure(body, len, "bytes body")?;
    let data = Bytes::copy_from_slice(&body[..len]);
    body.advance(len);
    Ok(data)
}

fn encode_opt_bytes(buf: &mut BytesMut, data: Option<&Bytes>) {
    match data {
        Some(data) => {
            buf.put_u8(1);
            encode_bytes(buf, data);
        }
        None => buf.put_u8(0),
    }
}

fn decode_opt_bytes(body: &mut &[u8]) -> CodecResult<Option<Bytes>> {
    ensure(body, 1, "optional flag")?;
    if body.get_u8() == 0 {
        Ok(None)
    } else {
        decode_bytes(body).map(Some)
    }
}

fn encode_opt_member_id(buf: &mut BytesMut, id: Option<MemberId>) {
    match id {
        Some(id) => {
            buf.put_u8(1);
            buf.put_u32_le(id.get());
        }
        None => buf.put_u8(0),
    }
}

fn decode_opt_member_id(body: &mut &[u8]) -> CodecResult<Option<MemberId>> {
    ensure(body, 1, "optional flag")?;
    if body.get_u8() == 0 {
        Ok(None)
    } else {
        ensure(body, 4, "member id")?;
        Ok(Some(MemberId::new(body.get_u32_le())))
    }
}

fn ensure(body: &&[u8], need: usize, what: &'static str) -> CodecResult<()> {
    if body.len() < need {
        return Err(CodecError::Malformed { reason: what });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip_request(request: Request) {
        let encoded = encode_request(99, &request).unwrap();
        let (frame, consumed) = decode_frame(&encoded).unwrap().unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(
            frame,
            Frame::Request {
                correlation_id: 99,
                request,
            }
        );
    }

    fn roundtrip_response(response: Response) {
        let encoded = encode_response(7, &response).unwrap();
        let (frame, consumed) = decode_frame(&encoded).unwrap().unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(
            frame,
            Frame::Response {
                correlation_id: 7,
                response,
            }
        );
    }

    fn make_entry(index: u64) -> Entry {
        Entry::new(
            LogIndex::new(index),
            TermId::new(2),
            EntryKind::Command,
            1234,
            Bytes::from_static(b"key"),
            Bytes::from_static(b"value"),
        )
        .unwrap()
    }

    #[test]
    fn test_append_request_roundtrip() {
        roundtrip_request(Request::Append(AppendRequest {
            term: TermId::new(3),
            leader: MemberId::new(1),
            prev_log_index: LogIndex::new(9),
            prev_log_term: TermId::new(2),
            entries: vec![make_entry(10), make_entry(11)],
            commit_index: LogIndex::new(8),
        }));
    }

    #[test]
    fn test_vote_and_poll_roundtrip() {
        roundtrip_request(Request::Vote(VoteRequest {
            term: TermId::new(4),
            candidate: MemberId::new(2),
            last_log_index: LogIndex::new(17),
            last_log_term: TermId::new(3),
        }));
        roundtrip_request(Request::Poll(PollRequest {
            term: TermId::new(5),
            candidate: MemberId::new(3),
            last_log_index: LogIndex::new(17),
            last_log_term: TermId::new(3),
        }));
    }

    #[test]
    fn test_sync_request_roundtrip() {
        let mut member = Member::new(MemberId::new(4), MemberKind::Passive, "127.0.0.1:5004");
        member.commit_index = LogIndex::new(40);
        member.version = 6;
        roundtrip_request(Request::Sync(SyncRequest {
            term: TermId::new(2),
            leader: Some(MemberId::new(1)),
            log_index: LogIndex::new(40),
            members: vec![member],
            entries: vec![make_entry(41)],
        }));
    }

    #[test]
    fn test_submit_roundtrip() {
        roundtrip_request(Request::Submit(SubmitRequest {
            operation: Operation::Command {
                key: Bytes::from_static(b"k"),
                payload: Bytes::from_static(b"v"),
            },
        }));
        roundtrip_request(Request::Submit(SubmitRequest {
            operation: Operation::Query {
                key: Bytes::from_static(b"k"),
                payload: Bytes::new(),
                consistency: Consistency::LinearizableStrict,
            },
        }));
        roundtrip_request(Request::Status(StatusRequest));
    }

    #[test]
    fn test_response_roundtrips() {
        roundtrip_response(Response::Append(AppendResponse::ok(
            TermId::new(2),
            true,
            LogIndex::new(11),
        )));
        roundtrip_response(Response::Vote(VoteResponse::ok(TermId::new(2), false)));
        roundtrip_response(Response::Poll(PollResponse::error(
            RaftErrorKind::IllegalMemberState,
            TermId::new(0),
        )));
        roundtrip_response(Response::Submit(SubmitResponse::ok(
            Some(Bytes::from_static(b"ok")),
            Some(MemberId::new(1)),
        )));
        roundtrip_response(Response::Submit(SubmitResponse::error(
            RaftErrorKind::NoLeader,
            None,
        )));
        roundtrip_response(Response::Status(StatusResponse::ok(
            TermId::new(9),
            Some(MemberId::new(2)),
        )));
    }

    #[test]
    fn test_partial_frame_returns_none() {
        let encoded = encode_request(1, &Request::Status(StatusRequest)).unwrap();
        for cut in 0..encoded.len() {
            assert!(decode_frame(&encoded[..cut]).unwrap().is_none());
        }
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let mut encoded =
            BytesMut::from(&encode_request(1, &Request::Status(StatusRequest)).unwrap()[..]);
        encoded[4] = 200;
        assert!(matches!(
            decode_frame(&encoded),
            Err(CodecError::UnknownFrameType { tag: 200 })
        ));
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let mut data = BytesMut::new();
        data.extend_from_slice(&encode_request(1, &Request::Status(StatusRequest)).unwrap());
        data.extend_from_slice(
            &encode_response(1, &Response::Status(StatusResponse::ok(TermId::new(1), None)))
                .unwrap(),
        );

        let (first, consumed) = decode_frame(&data).unwrap().unwrap();
        assert!(matches!(first, Frame::Request { .. }));
        let (second, _) = decode_frame(&data[consumed..]).unwrap().unwrap();
        assert!(matches!(second, Frame::Response { .. }));
    }
}

//! Networking primitives.
//!
//! Goals:
//! - Two logical channels: reliable-ordered (TCP frames) and
//!   unreliable-unordered (UDP datagrams).
//! - Fixed-layout, little-endian message payloads so every message type has a
//!   known size on the wire.
//! - Forward compatibility: unknown message tags decode to `None` and are
//!   skipped by receivers.

use std::net::SocketAddr;

use anyhow::Context;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::UdpSocket,
};

use crate::math::{Pose, Quat, Vec3};

/// Protocol version for handshake compatibility checks.
pub const PROTOCOL_VERSION: u32 = 1;

/// Capacity of the player-state array; connection slots are `0..MAX_PLAYERS`.
pub const MAX_PLAYERS: usize = 4;

/// Upper bound for a single reliable frame.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Largest datagram the unreliable channel will read.
pub const MAX_DATAGRAM_LEN: usize = 1200;

const VEC3_LEN: usize = 12;
const QUAT_LEN: usize = 16;
const TRANSFORM_LEN: usize = VEC3_LEN + QUAT_LEN;

/// Errors raised while encoding or decoding wire data.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("empty message")]
    Empty,
    #[error("{kind:?} payload truncated: need {needed} bytes, have {remaining}")]
    Truncated {
        kind: MessageType,
        needed: usize,
        remaining: usize,
    },
    #[error("frame of {0} bytes exceeds limit of {max}", max = MAX_FRAME_LEN)]
    FrameTooLarge(usize),
    #[error("unexpected handshake tag {0:#04x}")]
    UnexpectedTag(u8),
    #[error("malformed handshake: {0}")]
    Handshake(&'static str),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Logical stream within the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Scores, connect notifications, echo tests, sweep input.
    ReliableOrdered = 0,
    /// High-frequency snapshots; stale data is dropped rather than resent.
    UnreliableUnordered = 1,
}

impl Channel {
    pub const COUNT: usize = 2;
    pub const ALL: [Channel; Channel::COUNT] =
        [Channel::ReliableOrdered, Channel::UnreliableUnordered];

    pub const fn index(self) -> usize {
        self as usize
    }
}

// ─── Wire math ───

/// Wire vector: x, y, z.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct NetVec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl NetVec3 {
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

/// Wire quaternion, serialized in w, x, y, z order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NetQuat {
    pub w: f32,
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl NetQuat {
    pub const IDENTITY: Self = Self::new(1.0, 0.0, 0.0, 0.0);

    pub const fn new(w: f32, x: f32, y: f32, z: f32) -> Self {
        Self { w, x, y, z }
    }
}

impl Default for NetQuat {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Wire rigid transform.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct NetTransform {
    pub position: NetVec3,
    pub orientation: NetQuat,
}

impl From<Vec3> for NetVec3 {
    fn from(v: Vec3) -> Self {
        Self::new(v.x, v.y, v.z)
    }
}

impl From<NetVec3> for Vec3 {
    fn from(v: NetVec3) -> Self {
        Vec3::new(v.x, v.y, v.z)
    }
}

impl From<Quat> for NetQuat {
    fn from(q: Quat) -> Self {
        Self::new(q.w, q.x, q.y, q.z)
    }
}

impl From<NetQuat> for Quat {
    fn from(q: NetQuat) -> Self {
        Quat::new(q.w, q.x, q.y, q.z)
    }
}

impl From<Pose> for NetTransform {
    fn from(p: Pose) -> Self {
        Self {
            position: p.position.into(),
            orientation: p.orientation.into(),
        }
    }
}

impl From<NetTransform> for Pose {
    fn from(t: NetTransform) -> Self {
        Pose::new(t.position.into(), t.orientation.into())
    }
}

// ─── Payloads ───

/// Transform tagged with an object id (transform echo).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TransformData {
    pub id: i32,
    pub transform: NetTransform,
}

/// One dynamic actor's state for a tick.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RigidbodyState {
    pub id: i32,
    pub transform: NetTransform,
    pub linear_velocity: NetVec3,
    pub angular_velocity: NetVec3,
}

/// Client request to push the world along a swept sphere.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SweepForceInput {
    pub direction: NetVec3,
    pub position: NetVec3,
    pub radius: f32,
    /// Zero selects the server's configured default distance.
    pub distance: f32,
}

/// Head and hand transforms for one slot.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PlayerPose {
    /// Slot the pose describes. Ignored on inbound updates (the sender's slot wins).
    pub id: i32,
    pub head: NetTransform,
    pub left_hand: NetTransform,
    pub right_hand: NetTransform,
}

/// Message type tag as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Test = 0,
    TransformInfo = 1,
    SweepForceInput = 2,
    PlayerUpdate = 3,
    RigidbodyInfo = 4,
    ClientConnected = 5,
    UpdateScore = 6,
}

impl MessageType {
    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => Self::Test,
            1 => Self::TransformInfo,
            2 => Self::SweepForceInput,
            3 => Self::PlayerUpdate,
            4 => Self::RigidbodyInfo,
            5 => Self::ClientConnected,
            6 => Self::UpdateScore,
            _ => return None,
        })
    }

    pub const fn tag(self) -> u8 {
        self as u8
    }

    /// Fixed payload size, excluding the tag byte.
    pub const fn payload_len(self) -> usize {
        match self {
            Self::Test | Self::ClientConnected => 4,
            Self::TransformInfo => 4 + TRANSFORM_LEN,
            Self::SweepForceInput => 2 * VEC3_LEN + 8,
            Self::PlayerUpdate => 4 + 3 * TRANSFORM_LEN,
            Self::RigidbodyInfo => 4 + TRANSFORM_LEN + 2 * VEC3_LEN,
            Self::UpdateScore => 8,
        }
    }
}

/// Game-level message envelope.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GameMessage {
    /// Diagnostic counter; the server replies with `n + 1`.
    Test(i32),
    /// Diagnostic transform; the server echoes it unchanged.
    TransformInfo(TransformData),
    /// Client -> server: area push.
    SweepForceInput(SweepForceInput),
    /// Client -> server: own pose. Server -> client: another slot's pose.
    PlayerUpdate(PlayerPose),
    /// Server -> client: actor snapshot.
    RigidbodyInfo(RigidbodyState),
    /// Server -> client: connect-ack carrying the assigned slot.
    ClientConnected(i32),
    /// Server -> client: current score pair.
    UpdateScore { p1: i32, p2: i32 },
}

impl GameMessage {
    /// Creates a message of `kind` with a zeroed/identity payload.
    pub fn new(kind: MessageType) -> Self {
        match kind {
            MessageType::Test => Self::Test(0),
            MessageType::TransformInfo => Self::TransformInfo(TransformData::default()),
            MessageType::SweepForceInput => Self::SweepForceInput(SweepForceInput::default()),
            MessageType::PlayerUpdate => Self::PlayerUpdate(PlayerPose::default()),
            MessageType::RigidbodyInfo => Self::RigidbodyInfo(RigidbodyState::default()),
            MessageType::ClientConnected => Self::ClientConnected(0),
            MessageType::UpdateScore => Self::UpdateScore { p1: 0, p2: 0 },
        }
    }

    pub fn kind(&self) -> MessageType {
        match self {
            Self::Test(_) => MessageType::Test,
            Self::TransformInfo(_) => MessageType::TransformInfo,
            Self::SweepForceInput(_) => MessageType::SweepForceInput,
            Self::PlayerUpdate(_) => MessageType::PlayerUpdate,
            Self::RigidbodyInfo(_) => MessageType::RigidbodyInfo,
            Self::ClientConnected(_) => MessageType::ClientConnected,
            Self::UpdateScore { .. } => MessageType::UpdateScore,
        }
    }

    pub fn encoded_len(&self) -> usize {
        1 + self.kind().payload_len()
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.kind().tag());
        match self {
            Self::Test(n) | Self::ClientConnected(n) => buf.put_i32_le(*n),
            Self::TransformInfo(d) => {
                buf.put_i32_le(d.id);
                put_transform(buf, &d.transform);
            }
            Self::SweepForceInput(s) => {
                put_vec3(buf, &s.direction);
                put_vec3(buf, &s.position);
                buf.put_f32_le(s.radius);
                buf.put_f32_le(s.distance);
            }
            Self::PlayerUpdate(p) => {
                buf.put_i32_le(p.id);
                put_transform(buf, &p.head);
                put_transform(buf, &p.left_hand);
                put_transform(buf, &p.right_hand);
            }
            Self::RigidbodyInfo(r) => {
                buf.put_i32_le(r.id);
                put_transform(buf, &r.transform);
                put_vec3(buf, &r.linear_velocity);
                put_vec3(buf, &r.angular_velocity);
            }
            Self::UpdateScore { p1, p2 } => {
                buf.put_i32_le(*p1);
                buf.put_i32_le(*p2);
            }
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decodes one message. Unknown tags yield `Ok(None)`; trailing bytes
    /// past the fixed payload are ignored.
    pub fn decode(mut buf: &[u8]) -> Result<Option<Self>, WireError> {
        if !buf.has_remaining() {
            return Err(WireError::Empty);
        }
        let Some(kind) = MessageType::from_tag(buf.get_u8()) else {
            return Ok(None);
        };
        let needed = kind.payload_len();
        if buf.remaining() < needed {
            return Err(WireError::Truncated {
                kind,
                needed,
                remaining: buf.remaining(),
            });
        }

        let msg = match kind {
            MessageType::Test => Self::Test(buf.get_i32_le()),
            MessageType::ClientConnected => Self::ClientConnected(buf.get_i32_le()),
            MessageType::TransformInfo => Self::TransformInfo(TransformData {
                id: buf.get_i32_le(),
                transform: get_transform(&mut buf),
            }),
            MessageType::SweepForceInput => Self::SweepForceInput(SweepForceInput {
                direction: get_vec3(&mut buf),
                position: get_vec3(&mut buf),
                radius: buf.get_f32_le(),
                distance: buf.get_f32_le(),
            }),
            MessageType::PlayerUpdate => Self::PlayerUpdate(PlayerPose {
                id: buf.get_i32_le(),
                head: get_transform(&mut buf),
                left_hand: get_transform(&mut buf),
                right_hand: get_transform(&mut buf),
            }),
            MessageType::RigidbodyInfo => Self::RigidbodyInfo(RigidbodyState {
                id: buf.get_i32_le(),
                transform: get_transform(&mut buf),
                linear_velocity: get_vec3(&mut buf),
                angular_velocity: get_vec3(&mut buf),
            }),
            MessageType::UpdateScore => Self::UpdateScore {
                p1: buf.get_i32_le(),
                p2: buf.get_i32_le(),
            },
        };
        Ok(Some(msg))
    }
}

fn put_vec3(buf: &mut impl BufMut, v: &NetVec3) {
    buf.put_f32_le(v.x);
    buf.put_f32_le(v.y);
    buf.put_f32_le(v.z);
}

fn put_transform(buf: &mut impl BufMut, t: &NetTransform) {
    put_vec3(buf, &t.position);
    let q = &t.orientation;
    buf.put_f32_le(q.w);
    buf.put_f32_le(q.x);
    buf.put_f32_le(q.y);
    buf.put_f32_le(q.z);
}

fn get_vec3(buf: &mut impl Buf) -> NetVec3 {
    NetVec3::new(buf.get_f32_le(), buf.get_f32_le(), buf.get_f32_le())
}

fn get_transform(buf: &mut impl Buf) -> NetTransform {
    let position = get_vec3(buf);
    let orientation = NetQuat::new(
        buf.get_f32_le(),
        buf.get_f32_le(),
        buf.get_f32_le(),
        buf.get_f32_le(),
    );
    NetTransform {
        position,
        orientation,
    }
}

// ─── Handshake ───

const HELLO_TAG: u8 = 0xF0;
const DENIED_TAG: u8 = 0xF1;

/// Control frames exchanged on the reliable stream before a slot is assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handshake {
    /// Client -> server: protocol version and the client's UDP port.
    Hello { protocol: u32, udp_port: u16 },
    /// Server -> client: connection refused; the stream is closed afterwards.
    Denied { reason: String },
}

impl Handshake {
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Self::Hello { protocol, udp_port } => {
                buf.put_u8(HELLO_TAG);
                buf.put_u32_le(*protocol);
                buf.put_u16_le(*udp_port);
            }
            Self::Denied { reason } => {
                let reason = &reason.as_bytes()[..reason.len().min(u16::MAX as usize)];
                buf.put_u8(DENIED_TAG);
                buf.put_u16_le(reason.len() as u16);
                buf.put_slice(reason);
            }
        }
        buf.freeze()
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, WireError> {
        if !buf.has_remaining() {
            return Err(WireError::Empty);
        }
        match buf.get_u8() {
            HELLO_TAG => {
                if buf.remaining() < 6 {
                    return Err(WireError::Handshake("short hello"));
                }
                Ok(Self::Hello {
                    protocol: buf.get_u32_le(),
                    udp_port: buf.get_u16_le(),
                })
            }
            DENIED_TAG => {
                if buf.remaining() < 2 {
                    return Err(WireError::Handshake("short denial"));
                }
                let len = buf.get_u16_le() as usize;
                if buf.remaining() < len {
                    return Err(WireError::Handshake("short denial reason"));
                }
                let reason = String::from_utf8_lossy(&buf[..len]).into_owned();
                Ok(Self::Denied { reason })
            }
            other => Err(WireError::UnexpectedTag(other)),
        }
    }
}

// ─── Framing ───

/// Length-prefixed (u32 big-endian) frame ready for a stream write.
pub fn frame_bytes(payload: &[u8]) -> Result<Bytes, WireError> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge(payload.len()));
    }
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(payload);
    Ok(buf.freeze())
}

pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let frame = frame_bytes(payload)?;
    writer.write_all(&frame).await?;
    Ok(())
}

/// Reads one frame. A clean end of stream before a length prefix yields `None`.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Bytes>, WireError>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge(len));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(Bytes::from(payload)))
}

/// Client side of the unreliable channel: a UDP socket connected to the server.
#[derive(Debug)]
pub struct UnreliableConn {
    socket: UdpSocket,
}

impl UnreliableConn {
    pub async fn connect(bind_addr: SocketAddr, peer: SocketAddr) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(bind_addr).await.context("udp bind")?;
        socket.connect(peer).await.context("udp connect")?;
        Ok(Self { socket })
    }

    pub async fn send(&self, msg: &GameMessage) -> anyhow::Result<()> {
        self.socket
            .send(&msg.to_bytes())
            .await
            .context("udp send")?;
        Ok(())
    }

    /// Non-blocking receive. `None` when nothing is queued or the datagram
    /// carried an unknown tag.
    pub fn try_recv(&self) -> anyhow::Result<Option<GameMessage>> {
        let mut buf = [0u8; MAX_DATAGRAM_LEN];
        match self.socket.try_recv(&mut buf) {
            Ok(n) => Ok(GameMessage::decode(&buf[..n]).context("decode datagram")?),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e).context("udp recv"),
        }
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_transform() -> NetTransform {
        NetTransform {
            position: NetVec3::new(1.0, -2.5, 3.25),
            orientation: NetQuat::new(0.5, -0.5, 0.5, -0.5),
        }
    }

    #[test]
    fn payload_lengths_match_encoding() {
        let msgs = [
            GameMessage::Test(7),
            GameMessage::TransformInfo(TransformData {
                id: 3,
                transform: sample_transform(),
            }),
            GameMessage::SweepForceInput(SweepForceInput::default()),
            GameMessage::PlayerUpdate(PlayerPose::default()),
            GameMessage::RigidbodyInfo(RigidbodyState::default()),
            GameMessage::ClientConnected(1),
            GameMessage::UpdateScore { p1: 2, p2: 5 },
        ];
        for msg in msgs {
            assert_eq!(msg.to_bytes().len(), msg.encoded_len(), "{:?}", msg.kind());
        }
    }

    #[test]
    fn quaternion_is_written_w_first() {
        let msg = GameMessage::TransformInfo(TransformData {
            id: 9,
            transform: NetTransform {
                position: NetVec3::default(),
                orientation: NetQuat::new(0.25, 1.0, 2.0, 3.0),
            },
        });
        let bytes = msg.to_bytes();
        // tag + id + position
        let w = f32::from_le_bytes(bytes[17..21].try_into().unwrap());
        let x = f32::from_le_bytes(bytes[21..25].try_into().unwrap());
        assert_eq!(w, 0.25);
        assert_eq!(x, 1.0);
    }

    #[test]
    fn rigidbody_message_decodes_to_same_fields() {
        let state = RigidbodyState {
            id: 12,
            transform: sample_transform(),
            linear_velocity: NetVec3::new(0.0, -9.0, 0.5),
            angular_velocity: NetVec3::new(1.0, 0.0, 0.0),
        };
        let bytes = GameMessage::RigidbodyInfo(state).to_bytes();
        let back = GameMessage::decode(&bytes).unwrap();
        assert_eq!(back, Some(GameMessage::RigidbodyInfo(state)));
    }

    #[test]
    fn unknown_tag_is_skipped() {
        assert!(GameMessage::decode(&[0x42, 1, 2, 3]).unwrap().is_none());
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let bytes = GameMessage::UpdateScore { p1: 1, p2: 2 }.to_bytes();
        let err = GameMessage::decode(&bytes[..5]).unwrap_err();
        assert!(matches!(
            err,
            WireError::Truncated {
                kind: MessageType::UpdateScore,
                needed: 8,
                remaining: 4
            }
        ));
        assert!(matches!(GameMessage::decode(&[]), Err(WireError::Empty)));
    }

    #[test]
    fn pose_conversion_keeps_component_order() {
        let pose = Pose::new(Vec3::new(1.0, 2.0, 3.0), Quat::new(0.1, 0.2, 0.3, 0.4));
        let wire = NetTransform::from(pose);
        assert_eq!(wire.orientation, NetQuat::new(0.1, 0.2, 0.3, 0.4));
        assert_eq!(Pose::from(wire), pose);
    }

    #[test]
    fn handshake_denial_carries_reason() {
        let denied = Handshake::Denied {
            reason: "server full".into(),
        };
        assert_eq!(Handshake::decode(&denied.to_bytes()).unwrap(), denied);
        assert!(matches!(
            Handshake::decode(&GameMessage::Test(1).to_bytes()),
            Err(WireError::UnexpectedTag(0))
        ));
    }

    #[tokio::test]
    async fn frames_survive_a_stream() {
        let (mut a, mut b) = tokio::io::duplex(256);
        write_frame(&mut a, &GameMessage::Test(41).to_bytes())
            .await
            .unwrap();
        drop(a);
        let frame = read_frame(&mut b).await.unwrap().unwrap();
        assert_eq!(
            GameMessage::decode(&frame).unwrap(),
            Some(GameMessage::Test(41))
        );
        assert!(read_frame(&mut b).await.unwrap().is_none());
    }

    #[test]
    fn oversized_frame_is_refused() {
        let payload = vec![0u8; MAX_FRAME_LEN + 1];
        assert!(matches!(
            frame_bytes(&payload),
            Err(WireError::FrameTooLarge(_))
        ));
    }
}

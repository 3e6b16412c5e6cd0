use crate::error::{Result, ShmCommError};
use crate::host::Bootstrap;
use crate::shm::SegmentHandle;

/// Size of one participant's slot in an exchange.
///
/// The first two bytes carry the encoded length (little-endian); a length of
/// zero marks a participant that could not encode its record.
pub const FRAME_LEN: usize = 1024;

/// Records exchanged through the bootstrap while forming the engine.
///
/// Every record carries an `ok` flag so a participant that failed locally
/// still takes part in the exchange and every peer aborts together.
#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, PartialEq)]
pub enum BootstrapRecord {
    /// Per-participant identity, published before the hierarchy is built.
    RankInfo {
        ok: bool,
        pid: u32,
        /// Staging buffer for small payloads, if configured.
        cico: Option<SegmentHandle>,
    },
    /// Per-level group information.
    CommInfo {
        ok: bool,
        /// This participant's manager at the level.
        manager: u32,
        /// Control segment, published by the manager only.
        ctrl: Option<SegmentHandle>,
    },
    /// Confirms a preceding attach step.
    Ack { ok: bool },
}

impl BootstrapRecord {
    pub fn is_ok(&self) -> bool {
        match self {
            BootstrapRecord::RankInfo { ok, .. }
            | BootstrapRecord::CommInfo { ok, .. }
            | BootstrapRecord::Ack { ok } => *ok,
        }
    }
}

/// Encode `rec` into a fixed-size frame.
pub fn encode_frame(rec: &BootstrapRecord) -> Result<[u8; FRAME_LEN]> {
    let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(rec)
        .map_err(|e| ShmCommError::EncodeFailed(e.to_string()))?;
    if bytes.is_empty() || bytes.len() > FRAME_LEN - 2 {
        return Err(ShmCommError::EncodeFailed(format!(
            "record needs {} bytes, frame holds {}",
            bytes.len(),
            FRAME_LEN - 2
        )));
    }
    let mut frame = [0u8; FRAME_LEN];
    frame[..2].copy_from_slice(&(bytes.len() as u16).to_le_bytes());
    frame[2..2 + bytes.len()].copy_from_slice(&bytes);
    Ok(frame)
}

/// Decode a frame; `Ok(None)` for the failure marker.
pub fn decode_frame(frame: &[u8]) -> Result<Option<BootstrapRecord>> {
    if frame.len() < 2 {
        return Err(ShmCommError::DecodeFailed("truncated frame".into()));
    }
    let len = u16::from_le_bytes([frame[0], frame[1]]) as usize;
    if len == 0 {
        return Ok(None);
    }
    let payload = frame
        .get(2..2 + len)
        .ok_or_else(|| ShmCommError::DecodeFailed(format!("length {len} exceeds frame")))?;

    // Archived data must be aligned; frames in the gather buffer are not.
    let mut aligned = rkyv::util::AlignedVec::<16>::with_capacity(len);
    aligned.extend_from_slice(payload);
    rkyv::from_bytes::<BootstrapRecord, rkyv::rancor::Error>(&aligned)
        .map(Some)
        .map_err(|e| ShmCommError::DecodeFailed(e.to_string()))
}

/// All-gather one record per participant.
///
/// A local encode failure is sent as the failure marker. If any participant
/// reports failure, every participant returns [`ShmCommError::InitAborted`].
pub fn exchange(
    boot: &dyn Bootstrap,
    stage: &'static str,
    rec: &BootstrapRecord,
) -> Result<Vec<BootstrapRecord>> {
    let frame = encode_frame(rec).unwrap_or_else(|e| {
        tracing::warn!(stage, "shm bootstrap record not sent: {e}");
        [0u8; FRAME_LEN]
    });

    let n = boot.world_size() as usize;
    let mut recv = vec![0u8; n * FRAME_LEN];
    boot.allgather(&frame, &mut recv)?;

    let mut out = Vec::with_capacity(n);
    let mut failed = false;
    for (r, chunk) in recv.chunks_exact(FRAME_LEN).enumerate() {
        match decode_frame(chunk) {
            Ok(Some(rec)) if rec.is_ok() => out.push(rec),
            Ok(_) => {
                tracing::debug!(stage, peer = r, "shm peer reported failure");
                failed = true;
            }
            // Every participant decodes the same bytes, so this is symmetric.
            Err(e) => {
                tracing::warn!(stage, peer = r, "shm bootstrap record unreadable: {e}");
                failed = true;
            }
        }
    }
    if failed {
        return Err(ShmCommError::InitAborted { stage });
    }
    Ok(out)
}

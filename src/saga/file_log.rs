use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{Result, ScootError};
use crate::saga::log::SagaLog;
use crate::saga::message::{JobId, MessageKind, SagaMessage};

const SEGMENT_EXT: &str = "saga";
const LOCK_SHARDS: usize = 16;

/// Durable saga log: one append-only segment file per job.
///
/// Record frame, all integers little-endian:
/// `[u32 len][u8 kind][u64 job_id_len][job_id][u64 task_id_len][task_id]`
/// `[u64 data_len][data][u32 crc32]`
///
/// `len` counts the bytes from `kind` through the end of `data`; the CRC
/// covers `len` through `data`. Appends are flushed and fsync'd before
/// returning. A truncated trailing record is discarded on open; a bad CRC
/// on a fully-present record is corruption.
pub struct FileSagaLog {
    root: PathBuf,
    shards: Vec<Mutex<()>>,
}

impl FileSagaLog {
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            shards: (0..LOCK_SHARDS).map(|_| Mutex::new(())).collect(),
        })
    }

    fn segment_path(&self, job_id: JobId) -> PathBuf {
        self.root.join(format!("{}.{}", job_id, SEGMENT_EXT))
    }

    fn shard(&self, job_id: JobId) -> &Mutex<()> {
        let idx = job_id.as_bytes()[0] as usize % LOCK_SHARDS;
        &self.shards[idx]
    }

    fn append_frame(&self, path: &Path, msg: &SagaMessage) -> Result<()> {
        let frame = encode_frame(msg);
        let mut file = OpenOptions::new().append(true).open(path)?;
        file.write_all(&frame)?;
        file.sync_data()?;
        Ok(())
    }

    fn read_segment(&self, job_id: JobId) -> Result<Vec<SagaMessage>> {
        let path = self.segment_path(job_id);
        let mut file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ScootError::JobNotFound(job_id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        decode_segment(job_id, &buf)
    }
}

impl SagaLog for FileSagaLog {
    fn start_saga(&self, job_id: JobId, job_blob: &[u8]) -> Result<()> {
        let _guard = self.shard(job_id).lock().unwrap();
        let path = self.segment_path(job_id);
        if path.exists() {
            let msgs = self.read_segment(job_id)?;
            if msgs.first().map(|m| m.data.as_slice()) == Some(job_blob) {
                return Ok(());
            }
            return Err(ScootError::AlreadyStarted(job_id.to_string()));
        }
        // Write the first frame to a temp file and rename so a crash
        // mid-create never leaves a segment without its StartSaga.
        let msg = SagaMessage::start_saga(job_id, job_blob.to_vec());
        let tmp = path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&encode_frame(&msg))?;
            file.sync_data()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn log_message(&self, msg: &SagaMessage) -> Result<()> {
        let _guard = self.shard(msg.job_id).lock().unwrap();
        let path = self.segment_path(msg.job_id);
        if !path.exists() {
            return Err(ScootError::SagaNotStarted(msg.job_id.to_string()));
        }
        self.append_frame(&path, msg)
    }

    fn messages(&self, job_id: JobId) -> Result<Vec<SagaMessage>> {
        let _guard = self.shard(job_id).lock().unwrap();
        self.read_segment(job_id)
    }

    fn active_sagas(&self) -> Result<Vec<JobId>> {
        let mut active = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SEGMENT_EXT) {
                continue;
            }
            let Some(job_id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<JobId>().ok())
            else {
                tracing::warn!(path = %path.display(), "Skipping unrecognized saga segment");
                continue;
            };
            let msgs = self.messages(job_id)?;
            if !msgs.iter().any(|m| m.kind == MessageKind::EndSaga) {
                active.push(job_id);
            }
        }
        active.sort();
        Ok(active)
    }
}

fn encode_frame(msg: &SagaMessage) -> Vec<u8> {
    let job_id = msg.job_id.to_string();
    let task_id = msg.task_id.as_deref().unwrap_or("");
    let body_len = 1 + 8 + job_id.len() + 8 + task_id.len() + 8 + msg.data.len();

    let mut frame = Vec::with_capacity(4 + body_len + 4);
    frame.extend_from_slice(&(body_len as u32).to_le_bytes());
    frame.push(msg.kind as u8);
    frame.extend_from_slice(&(job_id.len() as u64).to_le_bytes());
    frame.extend_from_slice(job_id.as_bytes());
    frame.extend_from_slice(&(task_id.len() as u64).to_le_bytes());
    frame.extend_from_slice(task_id.as_bytes());
    frame.extend_from_slice(&(msg.data.len() as u64).to_le_bytes());
    frame.extend_from_slice(&msg.data);

    let crc = crc32fast::hash(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

fn decode_segment(job_id: JobId, buf: &[u8]) -> Result<Vec<SagaMessage>> {
    let mut msgs = Vec::new();
    let mut pos = 0usize;
    while pos < buf.len() {
        let remaining = buf.len() - pos;
        if remaining < 4 {
            tracing::warn!(%job_id, "Discarding truncated trailing record");
            break;
        }
        let body_len = u32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap()) as usize;
        let frame_len = 4 + body_len + 4;
        if remaining < frame_len {
            tracing::warn!(%job_id, "Discarding truncated trailing record");
            break;
        }
        let frame = &buf[pos..pos + frame_len];
        let crc_stored = u32::from_le_bytes(frame[frame_len - 4..].try_into().unwrap());
        let crc_actual = crc32fast::hash(&frame[..frame_len - 4]);
        if crc_stored != crc_actual {
            return Err(ScootError::Corrupt(format!(
                "saga {} record at offset {} fails crc",
                job_id, pos
            )));
        }
        msgs.push(decode_body(job_id, &frame[4..frame_len - 4], pos)?);
        pos += frame_len;
    }
    Ok(msgs)
}

fn decode_body(job_id: JobId, body: &[u8], offset: usize) -> Result<SagaMessage> {
    let corrupt = || {
        ScootError::Corrupt(format!(
            "saga {} record at offset {} is malformed",
            job_id, offset
        ))
    };
    let mut pos = 0usize;

    let kind = MessageKind::from_code(*body.first().ok_or_else(corrupt)?).ok_or_else(corrupt)?;
    pos += 1;

    let mut read_chunk = |pos: &mut usize| -> Result<Vec<u8>> {
        if body.len() < *pos + 8 {
            return Err(corrupt());
        }
        let len = u64::from_le_bytes(body[*pos..*pos + 8].try_into().unwrap()) as usize;
        *pos += 8;
        if body.len() < *pos + len {
            return Err(corrupt());
        }
        let chunk = body[*pos..*pos + len].to_vec();
        *pos += len;
        Ok(chunk)
    };

    let frame_job_id: JobId = String::from_utf8(read_chunk(&mut pos)?)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(corrupt)?;
    if frame_job_id != job_id {
        return Err(corrupt());
    }
    let task_id = String::from_utf8(read_chunk(&mut pos)?).map_err(|_| corrupt())?;
    let data = read_chunk(&mut pos)?;
    if pos != body.len() {
        return Err(corrupt());
    }

    Ok(SagaMessage {
        job_id,
        kind,
        task_id: if task_id.is_empty() {
            None
        } else {
            Some(task_id)
        },
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_frame_round_trip() {
        let job_id = Uuid::new_v4();
        let msg = SagaMessage::end_task(job_id, "t1", b"result".to_vec());
        let frame = encode_frame(&msg);
        let decoded = decode_segment(job_id, &frame).unwrap();
        assert_eq!(decoded, vec![msg]);
    }

    #[test]
    fn test_truncated_tail_discarded() {
        let job_id = Uuid::new_v4();
        let mut buf = encode_frame(&SagaMessage::start_saga(job_id, b"job".to_vec()));
        let mut partial = encode_frame(&SagaMessage::start_task(job_id, "t1", Vec::new()));
        partial.truncate(partial.len() / 2);
        buf.extend_from_slice(&partial);

        let decoded = decode_segment(job_id, &buf).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].kind, MessageKind::StartSaga);
    }

    #[test]
    fn test_bad_crc_is_corruption() {
        let job_id = Uuid::new_v4();
        let mut buf = encode_frame(&SagaMessage::start_saga(job_id, b"job".to_vec()));
        let flip = buf.len() / 2;
        buf[flip] ^= 0xff;
        // Append a full valid record after it so the bad one is not a tail.
        buf.extend_from_slice(&encode_frame(&SagaMessage::end_saga(job_id)));

        assert!(matches!(
            decode_segment(job_id, &buf),
            Err(ScootError::Corrupt(_))
        ));
    }
}

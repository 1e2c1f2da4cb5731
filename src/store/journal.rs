use crate::config::{DurabilityMode, RecoveryMode};
use crate::error::AspectDbError;
use crate::store::state::{RecordOp, StoreState};
use crc32c::crc32c;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{info, warn};

/// Sanity cap on a single frame body. Checkpoints carry the whole store
/// state in one frame, so this bounds store size, not commit size.
pub const MAX_FRAME_BODY_BYTES: usize = 1024 * 1024 * 1024;

const COMMIT_FRAME: u8 = 0x01;
const CHECKPOINT_FRAME: u8 = 0x02;

const JOURNAL_PREFIX: &str = "journal_";
const CHECKPOINT_PREFIX: &str = "checkpoint_";
const FILE_SUFFIX: &str = ".adb";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("truncated frame")]
    Truncation,
    #[error("corrupt frame")]
    Corruption,
    #[error("io error: {0}")]
    Io(String),
}

impl From<io::Error> for FrameError {
    fn from(value: io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Frame {
    seq: u64,
    kind: u8,
    payload: Vec<u8>,
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

fn write_frame<W: Write>(out: &mut W, seq: u64, kind: u8, payload: &[u8]) -> Result<u64, FrameError> {
    let body_len = 8 + 8 + 1 + payload.len() + 4;
    let frame_length = u32::try_from(body_len).map_err(|_| FrameError::Corruption)?;
    if body_len > MAX_FRAME_BODY_BYTES {
        return Err(FrameError::Corruption);
    }
    let len_bytes = frame_length.to_be_bytes();
    let seq_bytes = seq.to_be_bytes();
    let ts_bytes = now_micros().to_be_bytes();
    let kind_bytes = [kind];

    let mut crc_input = Vec::with_capacity(4 + body_len - 4);
    crc_input.extend_from_slice(&len_bytes);
    crc_input.extend_from_slice(&seq_bytes);
    crc_input.extend_from_slice(&ts_bytes);
    crc_input.extend_from_slice(&kind_bytes);
    crc_input.extend_from_slice(payload);
    let crc = crc32c(&crc_input).to_be_bytes();

    out.write_all(&len_bytes)?;
    out.write_all(&seq_bytes)?;
    out.write_all(&ts_bytes)?;
    out.write_all(&kind_bytes)?;
    out.write_all(payload)?;
    out.write_all(&crc)?;
    Ok(4 + body_len as u64)
}

fn read_frame<R: Read>(input: &mut R) -> Result<Option<Frame>, FrameError> {
    let mut len_buf = [0u8; 4];
    let first = input.read(&mut len_buf[0..1])?;
    if first == 0 {
        return Ok(None);
    }
    match input.read_exact(&mut len_buf[1..4]) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Err(FrameError::Truncation),
        Err(e) => return Err(FrameError::Io(e.to_string())),
    }
    let body_len = u32::from_be_bytes(len_buf) as usize;
    if body_len < 8 + 8 + 1 + 4 || body_len > MAX_FRAME_BODY_BYTES {
        return Err(FrameError::Corruption);
    }

    let mut body = vec![0u8; body_len];
    match input.read_exact(&mut body) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Err(FrameError::Truncation),
        Err(e) => return Err(FrameError::Io(e.to_string())),
    }

    let crc_offset = body_len - 4;
    let stored_crc = u32::from_be_bytes(
        body[crc_offset..]
            .try_into()
            .map_err(|_| FrameError::Corruption)?,
    );
    let mut crc_input = Vec::with_capacity(4 + crc_offset);
    crc_input.extend_from_slice(&len_buf);
    crc_input.extend_from_slice(&body[..crc_offset]);
    if stored_crc != crc32c(&crc_input) {
        return Err(FrameError::Corruption);
    }

    let seq = u64::from_be_bytes(body[0..8].try_into().map_err(|_| FrameError::Corruption)?);
    // Bytes 8..16 hold the write timestamp; nothing in recovery keys off it.
    let kind = body[16];
    let payload = body[17..crc_offset].to_vec();

    Ok(Some(Frame { seq, kind, payload }))
}

/// Creates the store directory with owner-only permissions (0o700 on Unix)
/// so database files are not readable by other users on shared hosts.
fn create_private_dir_all(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::fs::DirBuilder;
        use std::os::unix::fs::DirBuilderExt;
        let mut builder = DirBuilder::new();
        builder.recursive(true);
        builder.mode(0o700);
        builder.create(path)
    }
    #[cfg(not(unix))]
    {
        fs::create_dir_all(path)
    }
}

pub(crate) fn journal_path(dir: &Path, base_seq: u64) -> PathBuf {
    dir.join(format!("{JOURNAL_PREFIX}{base_seq:016}{FILE_SUFFIX}"))
}

pub(crate) fn checkpoint_path(dir: &Path, seq: u64) -> PathBuf {
    dir.join(format!("{CHECKPOINT_PREFIX}{seq:016}{FILE_SUFFIX}"))
}

fn parse_seq(name: &str, prefix: &str) -> Option<u64> {
    if !name.starts_with(prefix) || !name.ends_with(FILE_SUFFIX) {
        return None;
    }
    name.trim_start_matches(prefix)
        .trim_end_matches(FILE_SUFFIX)
        .parse::<u64>()
        .ok()
}

fn scan_dir(dir: &Path) -> Result<(Vec<(u64, PathBuf)>, Vec<(u64, PathBuf)>), AspectDbError> {
    let mut checkpoints = Vec::new();
    let mut journals = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if let Some(seq) = parse_seq(&name, CHECKPOINT_PREFIX) {
            checkpoints.push((seq, entry.path()));
        } else if let Some(base) = parse_seq(&name, JOURNAL_PREFIX) {
            journals.push((base, entry.path()));
        }
    }
    checkpoints.sort_by_key(|(seq, _)| *seq);
    journals.sort_by_key(|(base, _)| *base);
    Ok((checkpoints, journals))
}

fn fsync_dir(dir: &Path) -> Result<(), AspectDbError> {
    let handle = File::open(dir)?;
    handle.sync_all()?;
    Ok(())
}

/// Appends one frame per committed transaction to the active journal file.
#[derive(Debug)]
pub struct JournalWriter {
    file: File,
    base_seq: u64,
    bytes_written: u64,
    durability: DurabilityMode,
}

impl JournalWriter {
    pub fn create(dir: &Path, base_seq: u64, durability: DurabilityMode) -> Result<Self, AspectDbError> {
        let path = journal_path(dir, base_seq);
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)?;
        fsync_dir(dir)?;
        Ok(Self {
            file,
            base_seq,
            bytes_written: 0,
            durability,
        })
    }

    pub fn resume(dir: &Path, base_seq: u64, durability: DurabilityMode) -> Result<Self, AspectDbError> {
        let path = journal_path(dir, base_seq);
        let file = OpenOptions::new().append(true).open(&path)?;
        let bytes_written = file.metadata()?.len();
        Ok(Self {
            file,
            base_seq,
            bytes_written,
            durability,
        })
    }

    pub fn append_commit(&mut self, seq: u64, ops: &[RecordOp]) -> Result<(), AspectDbError> {
        let payload =
            rmp_serde::to_vec(ops).map_err(|e| AspectDbError::Encode(e.to_string()))?;
        let written = write_frame(&mut self.file, seq, COMMIT_FRAME, &payload)
            .map_err(|e| AspectDbError::Commit(format!("journal append failed: {e}")))?;
        self.file
            .flush()
            .map_err(|e| AspectDbError::Commit(format!("journal flush failed: {e}")))?;
        if self.durability == DurabilityMode::Full {
            self.file
                .sync_data()
                .map_err(|e| AspectDbError::Commit(format!("journal fsync failed: {e}")))?;
        }
        self.bytes_written += written;
        Ok(())
    }

    pub fn base_seq(&self) -> u64 {
        self.base_seq
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}

/// Writes a whole-state checkpoint as a single frame, temp-file then rename so
/// a crash never leaves a half-written checkpoint under the final name.
pub fn write_checkpoint(dir: &Path, seq: u64, state: &StoreState) -> Result<PathBuf, AspectDbError> {
    let payload = rmp_serde::to_vec(state).map_err(|e| AspectDbError::Encode(e.to_string()))?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    write_frame(tmp.as_file_mut(), seq, CHECKPOINT_FRAME, &payload).map_err(|e| match e {
        FrameError::Io(msg) => AspectDbError::Encode(msg),
        other => AspectDbError::Encode(other.to_string()),
    })?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;
    let path = checkpoint_path(dir, seq);
    tmp.persist(&path).map_err(|e| AspectDbError::Io(e.error))?;
    fsync_dir(dir)?;
    Ok(path)
}

fn read_checkpoint(path: &Path) -> Result<(u64, StoreState), AspectDbError> {
    let mut reader = BufReader::new(File::open(path)?);
    let frame = read_frame(&mut reader)
        .map_err(|e| AspectDbError::Corruption {
            message: format!("checkpoint {}: {e}", path.display()),
        })?
        .ok_or_else(|| AspectDbError::Corruption {
            message: format!("checkpoint {} is empty", path.display()),
        })?;
    if frame.kind != CHECKPOINT_FRAME {
        return Err(AspectDbError::Corruption {
            message: format!("checkpoint {} has wrong frame kind", path.display()),
        });
    }
    let state: StoreState =
        rmp_serde::from_slice(&frame.payload).map_err(|e| AspectDbError::Decode(e.to_string()))?;
    Ok((frame.seq, state))
}

/// Removes journal and checkpoint files strictly older than the given seq.
pub fn prune_older(dir: &Path, seq: u64) -> Result<(), AspectDbError> {
    let (checkpoints, journals) = scan_dir(dir)?;
    for (ckpt_seq, path) in checkpoints {
        if ckpt_seq < seq {
            let _ = fs::remove_file(path);
        }
    }
    for (base, path) in journals {
        if base < seq {
            let _ = fs::remove_file(path);
        }
    }
    fsync_dir(dir)?;
    Ok(())
}

#[derive(Debug)]
pub struct JournalRecovery {
    pub state: StoreState,
    pub last_seq: u64,
    pub checkpoint_seq: Option<u64>,
    pub replayed_commits: u64,
    pub writer: JournalWriter,
}

/// Rebuilds store state from a directory: newest readable checkpoint plus a
/// replay of every commit frame after it, then hands back an append-ready
/// writer on the newest journal file.
pub fn open_dir(
    dir: &Path,
    recovery_mode: RecoveryMode,
    durability: DurabilityMode,
) -> Result<JournalRecovery, AspectDbError> {
    create_private_dir_all(dir)?;
    let (checkpoints, journals) = scan_dir(dir)?;

    let mut state = StoreState::default();
    let mut last_seq = 0u64;
    let mut checkpoint_seq = None;
    for (seq, path) in checkpoints.iter().rev() {
        match read_checkpoint(path) {
            Ok((frame_seq, loaded)) => {
                if frame_seq != *seq {
                    return Err(AspectDbError::Corruption {
                        message: format!(
                            "checkpoint {} claims seq {frame_seq}, name says {seq}",
                            path.display()
                        ),
                    });
                }
                state = loaded;
                last_seq = *seq;
                checkpoint_seq = Some(*seq);
                break;
            }
            Err(e) if recovery_mode == RecoveryMode::Permissive => {
                warn!(path = %path.display(), error = %e, "skipping unreadable checkpoint");
            }
            Err(e) => return Err(e),
        }
    }

    let mut replayed = 0u64;
    // Set when replay stops before the end of a file: (index, clean length).
    // Everything after that point gets discarded so appends land right after
    // the last replayed frame instead of behind unreachable bytes.
    let mut repair: Option<(usize, u64)> = None;
    let last_journal_idx = journals.len().saturating_sub(1);
    'files: for (idx, (base, path)) in journals.iter().enumerate() {
        if let Some(ckpt) = checkpoint_seq {
            // A journal strictly older than the checkpoint whose successor
            // journal also predates it holds nothing we still need.
            if *base < ckpt && journals.get(idx + 1).map(|(b, _)| *b <= ckpt).unwrap_or(false) {
                continue;
            }
        }
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        let mut good_offset = 0u64;
        loop {
            match read_frame(&mut reader) {
                Ok(Some(frame)) => {
                    if frame.kind != COMMIT_FRAME {
                        if recovery_mode == RecoveryMode::Strict {
                            return Err(AspectDbError::Corruption {
                                message: format!(
                                    "unexpected frame kind in journal {}",
                                    path.display()
                                ),
                            });
                        }
                        warn!(path = %path.display(), "unexpected frame kind, keeping prefix");
                        repair = Some((idx, good_offset));
                        break 'files;
                    }
                    let frame_len = 4 + 8 + 8 + 1 + frame.payload.len() as u64 + 4;
                    if frame.seq <= last_seq {
                        good_offset += frame_len;
                        continue;
                    }
                    if frame.seq != last_seq + 1 {
                        if recovery_mode == RecoveryMode::Strict {
                            return Err(AspectDbError::Corruption {
                                message: format!(
                                    "journal {} jumps from seq {last_seq} to {}",
                                    path.display(),
                                    frame.seq
                                ),
                            });
                        }
                        warn!(
                            path = %path.display(),
                            expected = last_seq + 1,
                            found = frame.seq,
                            "commit sequence gap, keeping prefix"
                        );
                        repair = Some((idx, good_offset));
                        break 'files;
                    }
                    let ops: Vec<RecordOp> = rmp_serde::from_slice(&frame.payload)
                        .map_err(|e| AspectDbError::Decode(e.to_string()))?;
                    state.apply_all(&ops);
                    last_seq = frame.seq;
                    replayed += 1;
                    good_offset += frame_len;
                }
                Ok(None) => break,
                Err(FrameError::Truncation) => {
                    // A torn tail on the newest journal is a normal crash
                    // artifact; anywhere else it means lost commits.
                    if idx == last_journal_idx {
                        warn!(path = %path.display(), offset = good_offset, "torn journal tail, truncating");
                        repair = Some((idx, good_offset));
                        break 'files;
                    }
                    if recovery_mode == RecoveryMode::Strict {
                        return Err(AspectDbError::Corruption {
                            message: format!("truncated interior journal {}", path.display()),
                        });
                    }
                    warn!(path = %path.display(), "truncated interior journal, keeping prefix");
                    repair = Some((idx, good_offset));
                    break 'files;
                }
                Err(FrameError::Corruption) => {
                    if recovery_mode == RecoveryMode::Strict {
                        return Err(AspectDbError::Corruption {
                            message: format!("corrupt frame in journal {}", path.display()),
                        });
                    }
                    warn!(path = %path.display(), offset = good_offset, "corrupt frame, keeping prefix");
                    repair = Some((idx, good_offset));
                    break 'files;
                }
                Err(FrameError::Io(msg)) => {
                    return Err(AspectDbError::Io(io::Error::other(msg)));
                }
            }
        }
    }

    let resume_idx = match repair {
        Some((idx, clean_len)) => {
            truncate_to(&journals[idx].1, clean_len)?;
            for (_, orphan) in &journals[idx + 1..] {
                warn!(path = %orphan.display(), "removing journal stranded past the repair point");
                fs::remove_file(orphan)?;
            }
            if !journals[idx + 1..].is_empty() {
                fsync_dir(dir)?;
            }
            Some(idx)
        }
        None => journals.len().checked_sub(1),
    };
    let writer = match resume_idx {
        Some(idx) => JournalWriter::resume(dir, journals[idx].0, durability)?,
        None => JournalWriter::create(dir, last_seq, durability)?,
    };

    info!(
        last_seq,
        replayed,
        checkpoint = checkpoint_seq.unwrap_or(0),
        "journal recovery complete"
    );

    Ok(JournalRecovery {
        state,
        last_seq,
        checkpoint_seq,
        replayed_commits: replayed,
        writer,
    })
}

fn truncate_to(path: &Path, offset: u64) -> Result<(), AspectDbError> {
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(offset)?;
    file.sync_all()?;
    Ok(())
}

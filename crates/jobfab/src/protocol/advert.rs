// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 jobfab contributors

//! The discovery advertisement datagram.
//!
//! Broadcast by the master on a fixed cadence so idle services can find
//! the job. Field order on the wire:
//!
//! ```text
//! u8   protocol version
//! str  password
//! u8   kind (1 = look-for-workers, 2 = service-patch)
//! str  patch version ("" for a normal job)
//! i32  job listen port
//! i32  job id x4
//! u16  arg count, then that many strings (arg 0 = worker exe basename)
//! u8   force-patch flag
//! i16  downloader listen port (-1 when absent)
//! ```

use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::wire::{WireReader, WireWriter};
use super::ProtocolError;
use crate::config::{MAX_ADVERT_SIZE, PROTOCOL_VERSION};

/// What the master is advertising for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvertKind {
    /// A compute job looking for workers.
    LookForWorkers,
    /// A service-binary patch push.
    ServicePatch,
}

impl AdvertKind {
    fn to_wire(self) -> u8 {
        match self {
            AdvertKind::LookForWorkers => 1,
            AdvertKind::ServicePatch => 2,
        }
    }

    fn from_wire(v: u8) -> Result<Self, ProtocolError> {
        match v {
            1 => Ok(AdvertKind::LookForWorkers),
            2 => Ok(AdvertKind::ServicePatch),
            other => Err(ProtocolError::UnknownAdvertKind(other)),
        }
    }
}

/// One coherent snapshot of everything a service needs to join the job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub password: String,
    pub kind: AdvertKind,
    /// Empty for a normal job.
    pub patch_version: String,
    pub listen_port: i32,
    pub job_id: [i32; 4],
    /// Worker command line; arg 0 is the worker exe basename.
    pub args: Vec<String>,
    pub force_patch: bool,
    /// -1 when no downloader listener is up.
    pub downloader_port: i16,
}

impl Advertisement {
    /// Encode into a datagram payload. Fails if the result would blow the
    /// MTU budget - a misconfigured command line should surface at setup
    /// time, not as silent truncation on the wire.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut w = WireWriter::with_capacity(256);
        w.put_u8(PROTOCOL_VERSION);
        w.put_str(&self.password);
        w.put_u8(self.kind.to_wire());
        w.put_str(&self.patch_version);
        w.put_i32(self.listen_port);
        for part in self.job_id {
            w.put_i32(part);
        }
        assert!(self.args.len() <= u16::MAX as usize, "argv over u16::MAX entries");
        w.put_u16(self.args.len() as u16);
        for arg in &self.args {
            w.put_str(arg);
        }
        w.put_u8(u8::from(self.force_patch));
        w.put_i16(self.downloader_port);

        if w.len() > MAX_ADVERT_SIZE {
            return Err(ProtocolError::AdvertTooLarge(w.len()));
        }
        Ok(w.into_vec())
    }

    /// Parse a received datagram. Datagrams from a different protocol
    /// version are rejected up front.
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = WireReader::new(payload);
        let version = r.get_u8()?;
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::Version(version));
        }
        let password = r.get_str()?;
        let kind = AdvertKind::from_wire(r.get_u8()?)?;
        let patch_version = r.get_str()?;
        let listen_port = r.get_i32()?;
        let job_id = [r.get_i32()?, r.get_i32()?, r.get_i32()?, r.get_i32()?];
        let argc = r.get_u16()? as usize;
        let mut args = Vec::with_capacity(argc.min(256));
        for _ in 0..argc {
            args.push(r.get_str()?);
        }
        let force_patch = r.get_u8()? != 0;
        let downloader_port = r.get_i16()?;

        Ok(Self {
            password,
            kind,
            patch_version,
            listen_port,
            job_id,
            args,
            force_patch,
            downloader_port,
        })
    }
}

/// Produce a job id that is globally improbable to collide: four
/// high-resolution clock samples separated by real sleeps, so two masters
/// started in the same instant still diverge.
pub fn generate_job_id() -> [i32; 4] {
    let mut id = [0i32; 4];
    for part in &mut id {
        thread::sleep(Duration::from_millis(1));
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0);
        *part = nanos as i32;
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Advertisement {
        Advertisement {
            password: "hunter2".into(),
            kind: AdvertKind::LookForWorkers,
            patch_version: String::new(),
            listen_port: 23_301,
            job_id: [11, -22, 33, -44],
            args: vec![
                "vis.exe".into(),
                "-mpi_filebase".into(),
                "/jobs/de_site".into(),
                "de_site.bsp".into(),
            ],
            force_patch: false,
            downloader_port: 23_311,
        }
    }

    #[test]
    fn roundtrip() {
        let advert = sample();
        let decoded = Advertisement::decode(&advert.encode().unwrap()).unwrap();
        assert_eq!(decoded, advert);
    }

    #[test]
    fn patch_roundtrip() {
        let advert = Advertisement {
            kind: AdvertKind::ServicePatch,
            patch_version: "2.1".into(),
            force_patch: true,
            downloader_port: -1,
            ..sample()
        };
        let decoded = Advertisement::decode(&advert.encode().unwrap()).unwrap();
        assert_eq!(decoded, advert);
    }

    #[test]
    fn wrong_version_rejected() {
        let mut bytes = sample().encode().unwrap();
        bytes[0] = bytes[0].wrapping_add(1);
        assert!(matches!(
            Advertisement::decode(&bytes).unwrap_err(),
            ProtocolError::Version(_)
        ));
    }

    #[test]
    fn oversized_command_line_rejected_at_encode() {
        let advert = Advertisement {
            args: (0..200).map(|i| format!("-very_long_argument_number_{i}")).collect(),
            ..sample()
        };
        assert!(matches!(
            advert.encode().unwrap_err(),
            ProtocolError::AdvertTooLarge(_)
        ));
    }

    #[test]
    fn job_ids_differ_between_calls() {
        assert_ne!(generate_job_id(), generate_job_id());
    }
}

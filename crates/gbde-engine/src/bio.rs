//! Block I/O requests as seen by the consumer of an encrypted device.

use gbde_core::{BdeResult, BioCmd};
use tokio::sync::oneshot;

/// One request against the logical (plaintext) address space.
///
/// Offsets and lengths are in bytes and must be multiples of the sector size.
/// For reads `data` is filled on completion; for writes it holds the
/// plaintext; deletes ignore it.
#[derive(Debug)]
pub struct Bio {
    pub cmd: BioCmd,
    pub offset: u64,
    pub length: u64,
    pub data: Vec<u8>,
}

impl Bio {
    pub fn read(offset: u64, length: u64) -> Self {
        Bio {
            cmd: BioCmd::Read,
            offset,
            length,
            data: Vec::new(),
        }
    }

    pub fn write(offset: u64, data: Vec<u8>) -> Self {
        Bio {
            cmd: BioCmd::Write,
            offset,
            length: data.len() as u64,
            data,
        }
    }

    pub fn delete(offset: u64, length: u64) -> Self {
        Bio {
            cmd: BioCmd::Delete,
            offset,
            length,
            data: Vec::new(),
        }
    }
}

/// Completion of a submitted request: the request back (reads carry their
/// plaintext), or the error that ended it.
pub type BioCompletion = oneshot::Receiver<BdeResult<Bio>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_set_length() {
        assert_eq!(Bio::write(512, vec![0; 1024]).length, 1024);
        assert_eq!(Bio::read(0, 4096).cmd, BioCmd::Read);
        let d = Bio::delete(1024, 512);
        assert!(d.cmd.mutates());
        assert!(d.data.is_empty());
    }
}

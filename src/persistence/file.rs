use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::ids::{NodeId, Term};

use super::PersistentStore;

/// On-disk layout: a `current_term` file holding the term as decimal text,
/// and one `<term>.voted_for` file per term holding the bincode-encoded
/// candidate id we voted for. Both are written via write-to-temp-then-rename
/// so a crash mid-write can never leave a half-written file in place.
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(FileStore { dir })
    }

    fn term_path(&self) -> PathBuf {
        self.dir.join("current_term")
    }

    fn vote_path(&self, term: Term) -> PathBuf {
        self.dir.join(format!("{term}.voted_for"))
    }

    fn atomic_write(&self, path: &Path, bytes: &[u8]) -> io::Result<()> {
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, path)
    }
}

impl PersistentStore for FileStore {
    fn load(&self) -> io::Result<(Term, Option<(Term, NodeId)>)> {
        let term = match fs::read_to_string(self.term_path()) {
            Ok(s) => s.trim().parse().unwrap_or(0),
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e),
        };
        let vote = if term > 0 {
            match fs::read(self.vote_path(term)) {
                Ok(bytes) => bincode::deserialize::<NodeId>(&bytes).ok().map(|id| (term, id)),
                Err(e) if e.kind() == io::ErrorKind::NotFound => None,
                Err(e) => return Err(e),
            }
        } else {
            None
        };
        Ok((term, vote))
    }

    fn save_term(&mut self, term: Term) -> io::Result<()> {
        let path = self.term_path();
        self.atomic_write(&path, term.to_string().as_bytes())
    }

    fn save_vote(&mut self, term: Term, candidate: &NodeId) -> io::Result<()> {
        let bytes = bincode::serialize(candidate).expect("NodeId always serializes");
        let path = self.vote_path(term);
        self.atomic_write(&path, &bytes)
    }
}

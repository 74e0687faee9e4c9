use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use fprint_vision::Descriptor;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const FORMAT_VERSION: u8 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct StoreFile {
    version: u8,
    descriptors: Vec<Descriptor>,
}

/// Result of reading the store. A corrupt or unreadable file reads as an
/// empty store; the reason is kept in `warning`.
#[derive(Debug, Clone, PartialEq)]
pub struct Loaded {
    pub descriptors: Vec<Descriptor>,
    pub warning: Option<Error>,
}

/// Ordered descriptors in a single file. Position `i` (1-based) is the
/// identity "Fingerprint i".
///
/// Every operation holds the store lock for its whole read-modify-write,
/// and writes replace the file atomically, so readers only ever see a
/// complete old or complete new sequence.
pub struct DescriptorStore {
    path: PathBuf,
    lock: Mutex<()>,
    #[cfg(test)]
    faults: Faults,
}

/// Injected I/O failures for tests.
#[cfg(test)]
#[derive(Default)]
struct Faults {
    read: std::sync::atomic::AtomicBool,
    preserve: std::sync::atomic::AtomicBool,
    write: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
fn injected(flag: &std::sync::atomic::AtomicBool, what: &str) -> io::Result<()> {
    if flag.load(std::sync::atomic::Ordering::SeqCst) {
        return Err(io::Error::new(
            io::ErrorKind::Other,
            format!("injected {what} failure"),
        ));
    }
    Ok(())
}

impl DescriptorStore {
    pub fn open(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
            #[cfg(test)]
            faults: Faults::default(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load_all(&self) -> Loaded {
        let _guard = self.lock.lock();
        match self.read() {
            Ok(descriptors) => Loaded {
                descriptors,
                warning: None,
            },
            Err(e) => {
                log::warn!("treating descriptor store as empty: {}", e);
                Loaded {
                    descriptors: Vec::new(),
                    warning: Some(e),
                }
            }
        }
    }

    /// Number of enrolled descriptors, read from disk every time.
    pub fn len(&self) -> usize {
        self.load_all().descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends `descriptor` and returns its identity (the new length).
    pub fn append(&self, descriptor: Descriptor) -> Result<usize> {
        let _guard = self.lock.lock();
        let mut descriptors = self.read_for_update()?;

        if let Some(first) = descriptors.first() {
            if first.len() != descriptor.len() {
                return Err(Error::StorageWriteFailed(format!(
                    "descriptor has {} values, store holds {}-value descriptors",
                    descriptor.len(),
                    first.len()
                )));
            }
        }

        descriptors.push(descriptor);
        self.write(&descriptors)?;
        log::debug!("appended descriptor {}", descriptors.len());
        Ok(descriptors.len())
    }

    /// Removes the descriptor at 1-based `position`; later ones move up.
    pub fn delete_at(&self, position: usize) -> Result<()> {
        let _guard = self.lock.lock();
        let mut descriptors = self.read_for_update()?;

        if position == 0 || position > descriptors.len() {
            return Err(Error::OutOfRange {
                position,
                len: descriptors.len(),
            });
        }

        descriptors.remove(position - 1);
        self.write(&descriptors)?;
        log::debug!("deleted descriptor {}", position);
        Ok(())
    }

    fn read(&self) -> Result<Vec<Descriptor>> {
        let data = match self.read_bytes() {
            Ok(Some(data)) => data,
            Ok(None) => return Ok(Vec::new()),
            Err(e) => {
                return Err(Error::StorageReadCorrupt(format!(
                    "reading {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };

        let descriptors = decode(&data).map_err(|reason| {
            Error::StorageReadCorrupt(format!("{}: {}", self.path.display(), reason))
        })?;
        log::debug!("loaded {} descriptors", descriptors.len());
        Ok(descriptors)
    }

    /// Store bytes, or `None` when no store exists yet.
    fn read_bytes(&self) -> io::Result<Option<Vec<u8>>> {
        #[cfg(test)]
        injected(&self.faults.read, "read")?;

        match fs::read(&self.path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::debug!("no descriptor store at {}", self.path.display());
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Current sequence for a read-modify-write. A file that cannot be
    /// read is left alone and fails the update. A file that reads but does
    /// not decode is saved to a fresh `<store>.corrupt.<uuid>` first; if
    /// that copy cannot be made the update fails too.
    fn read_for_update(&self) -> Result<Vec<Descriptor>> {
        let data = match self.read_bytes() {
            Ok(Some(data)) => data,
            Ok(None) => return Ok(Vec::new()),
            Err(e) => {
                log::error!("cannot read {}: {}", self.path.display(), e);
                return Err(Error::StorageWriteFailed(format!(
                    "{} is unreadable, left unchanged: {}",
                    self.path.display(),
                    e
                )));
            }
        };

        match decode(&data) {
            Ok(descriptors) => Ok(descriptors),
            Err(reason) => {
                let aside = sidecar(&self.path, &format!("corrupt.{}", uuid::Uuid::new_v4()));
                self.preserve(&aside, &data).map_err(|e| {
                    log::error!("could not preserve corrupt {}: {}", self.path.display(), e);
                    Error::StorageWriteFailed(format!(
                        "{} is corrupt ({}) and could not be preserved: {}",
                        self.path.display(),
                        reason,
                        e
                    ))
                })?;
                log::warn!(
                    "{} is corrupt ({}); preserved as {}",
                    self.path.display(),
                    reason,
                    aside.display()
                );
                Ok(Vec::new())
            }
        }
    }

    fn preserve(&self, aside: &Path, data: &[u8]) -> io::Result<()> {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(aside)?;
        let written = self.fill(&mut file, data);
        if written.is_err() {
            let _ = fs::remove_file(aside);
        }
        written
    }

    fn fill(&self, file: &mut File, data: &[u8]) -> io::Result<()> {
        #[cfg(test)]
        injected(&self.faults.preserve, "preserve")?;

        file.write_all(data)?;
        file.sync_all()
    }

    fn write(&self, descriptors: &[Descriptor]) -> Result<()> {
        let data = postcard::to_allocvec(&StoreFile {
            version: FORMAT_VERSION,
            descriptors: descriptors.to_vec(),
        })
        .map_err(|e| Error::StorageWriteFailed(format!("encoding store: {e}")))?;

        self.replace(&data).map_err(|e| {
            log::error!("writing {} failed: {}", self.path.display(), e);
            Error::StorageWriteFailed(format!("{}: {}", self.path.display(), e))
        })?;
        log::debug!("saved {} descriptors", descriptors.len());
        Ok(())
    }

    /// Write-to-temporary then rename. The old file is untouched until the
    /// new one is complete and synced.
    fn replace(&self, data: &[u8]) -> io::Result<()> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;

        let tmp = sidecar(&self.path, &format!("{}.tmp", uuid::Uuid::new_v4()));
        let result = self.write_tmp(&tmp, data).and_then(|()| fs::rename(&tmp, &self.path));
        if result.is_err() {
            let _ = fs::remove_file(&tmp);
            return result;
        }

        #[cfg(unix)]
        {
            if let Ok(d) = File::open(&dir) {
                let _ = d.sync_all();
            }
        }
        Ok(())
    }

    fn write_tmp(&self, tmp: &Path, data: &[u8]) -> io::Result<()> {
        let mut file = File::create(tmp)?;

        #[cfg(test)]
        {
            if self.faults.write.load(std::sync::atomic::Ordering::SeqCst) {
                file.write_all(&data[..data.len() / 2])?;
                injected(&self.faults.write, "write")?;
            }
        }

        file.write_all(data)?;
        file.sync_all()
    }
}

fn decode(data: &[u8]) -> std::result::Result<Vec<Descriptor>, String> {
    let (file, rest) =
        postcard::take_from_bytes::<StoreFile>(data).map_err(|e| e.to_string())?;
    if !rest.is_empty() {
        return Err(format!("{} trailing bytes", rest.len()));
    }
    if file.version != FORMAT_VERSION {
        return Err(format!("unsupported store version {}", file.version));
    }
    Ok(file.descriptors)
}

fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn store() -> (TempDir, DescriptorStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = DescriptorStore::open(dir.path().join("fingerprint_embeddings.bin"));
        (dir, store)
    }

    fn descriptor(seed: f32) -> Descriptor {
        Descriptor::new((0..128).map(|i| seed + i as f32 * 1e-3).collect())
    }

    fn random_descriptor(rng: &mut impl Rng) -> Descriptor {
        Descriptor::new((0..128).map(|_| rng.gen_range(-1.0..1.0)).collect())
    }

    #[test]
    fn missing_file_is_empty_without_warning() {
        let (_dir, store) = store();
        let loaded = store.load_all();
        assert!(loaded.descriptors.is_empty());
        assert_eq!(loaded.warning, None);
    }

    #[test]
    fn append_to_empty_store_is_identity_one() {
        let (_dir, store) = store();
        let d = Descriptor::new(
            (0..128)
                .map(|i| if i % 2 == 0 { 0.1 } else { 0.2 })
                .collect(),
        );
        assert_eq!(store.append(d.clone()).unwrap(), 1);

        let loaded = store.load_all();
        assert_eq!(loaded.descriptors, vec![d]);
        assert_eq!(loaded.warning, None);
    }

    #[test]
    fn append_adds_to_the_end() {
        let mut rng = rand::thread_rng();
        let (_dir, store) = store();
        for n in 1..=6 {
            let d = random_descriptor(&mut rng);
            let before = store.load_all().descriptors;
            assert_eq!(store.append(d.clone()).unwrap(), n);

            let after = store.load_all().descriptors;
            assert_eq!(after.len(), before.len() + 1);
            assert_eq!(after[..before.len()], before[..]);
            assert_eq!(after.last(), Some(&d));
        }
    }

    #[test]
    fn delete_shifts_later_positions_down() {
        let mut rng = rand::thread_rng();
        for len in 1..=5 {
            for k in 1..=len {
                let (_dir, store) = store();
                let original: Vec<_> = (0..len).map(|_| random_descriptor(&mut rng)).collect();
                for d in &original {
                    store.append(d.clone()).unwrap();
                }

                store.delete_at(k).unwrap();
                let after = store.load_all().descriptors;

                let mut expected = original.clone();
                expected.remove(k - 1);
                assert_eq!(after, expected, "len {len} k {k}");
            }
        }
    }

    #[test]
    fn delete_middle_renumbers() {
        let (_dir, store) = store();
        let (a, b, c) = (descriptor(1.0), descriptor(2.0), descriptor(3.0));
        for d in [&a, &b, &c] {
            store.append(d.clone()).unwrap();
        }

        store.delete_at(2).unwrap();
        assert_eq!(store.load_all().descriptors, vec![a, c]);
    }

    #[test]
    fn delete_out_of_range_changes_nothing() {
        let (_dir, store) = store();
        store.append(descriptor(1.0)).unwrap();
        store.append(descriptor(2.0)).unwrap();
        let before = fs::read(store.path()).unwrap();

        for position in [0, 3, 99] {
            let err = store.delete_at(position).unwrap_err();
            assert_eq!(err, Error::OutOfRange { position, len: 2 });
        }
        assert_eq!(fs::read(store.path()).unwrap(), before);
    }

    #[test]
    fn delete_on_empty_store_is_out_of_range() {
        let (_dir, store) = store();
        assert!(matches!(
            store.delete_at(1),
            Err(Error::OutOfRange { position: 1, len: 0 })
        ));
        assert!(!store.path().exists());
    }

    #[test]
    fn repeated_reads_agree() {
        let (_dir, store) = store();
        store.append(descriptor(0.5)).unwrap();
        store.append(descriptor(-0.5)).unwrap();
        assert_eq!(store.load_all(), store.load_all());
    }

    #[test]
    fn floats_round_trip_bit_exact() {
        let (_dir, store) = store();
        let mut values = vec![0.0f32; 128];
        values[0] = -0.0;
        values[1] = f32::MIN_POSITIVE / 2.0;
        values[2] = f32::MAX;
        values[3] = f32::MIN;
        values[4] = 1.0 / 3.0;
        values[5] = f32::EPSILON;
        store.append(Descriptor::new(values.clone())).unwrap();

        let loaded = store.load_all().descriptors;
        let bits: Vec<u32> = loaded[0].as_slice().iter().map(|v| v.to_bits()).collect();
        let expected: Vec<u32> = values.iter().map(|v| v.to_bits()).collect();
        assert_eq!(bits, expected);
    }

    #[test]
    fn corrupt_file_reads_empty_with_warning() {
        let (_dir, store) = store();
        fs::write(store.path(), b"\x07definitely not postcard").unwrap();

        let loaded = store.load_all();
        assert!(loaded.descriptors.is_empty());
        assert!(matches!(loaded.warning, Some(Error::StorageReadCorrupt(_))));
    }

    #[test]
    fn truncated_file_is_corrupt() {
        let (_dir, store) = store();
        for seed in [1.0, 2.0, 3.0] {
            store.append(descriptor(seed)).unwrap();
        }
        let data = fs::read(store.path()).unwrap();
        fs::write(store.path(), &data[..data.len() - 9]).unwrap();

        assert!(matches!(
            store.load_all().warning,
            Some(Error::StorageReadCorrupt(_))
        ));
    }

    #[test]
    fn trailing_garbage_is_corrupt() {
        let (_dir, store) = store();
        store.append(descriptor(1.0)).unwrap();
        let mut data = fs::read(store.path()).unwrap();
        data.extend_from_slice(&[0, 1, 2]);
        fs::write(store.path(), data).unwrap();

        assert!(store.load_all().warning.is_some());
    }

    /// Contents of every `<store>.corrupt.*` file next to the store.
    fn corrupt_copies(store: &DescriptorStore) -> Vec<Vec<u8>> {
        let prefix = format!(
            "{}.corrupt.",
            store.path().file_name().unwrap().to_string_lossy()
        );
        let mut copies: Vec<_> = fs::read_dir(store.path().parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(&prefix))
            .map(|e| fs::read(e.path()).unwrap())
            .collect();
        copies.sort();
        copies
    }

    #[test]
    fn append_over_corrupt_store_keeps_a_copy() {
        let (_dir, store) = store();
        fs::write(store.path(), b"garbage").unwrap();

        assert_eq!(store.append(descriptor(1.0)).unwrap(), 1);
        assert_eq!(corrupt_copies(&store), vec![b"garbage".to_vec()]);
        assert_eq!(store.load_all().warning, None);
    }

    #[test]
    fn each_corruption_gets_its_own_copy() {
        let (_dir, store) = store();
        fs::write(store.path(), b"first-garbage").unwrap();
        store.append(descriptor(1.0)).unwrap();
        fs::write(store.path(), b"second-garbage").unwrap();
        store.delete_at(1).unwrap_err();
        fs::write(store.path(), b"third-garbage").unwrap();
        store.append(descriptor(2.0)).unwrap();

        assert_eq!(
            corrupt_copies(&store),
            vec![
                b"first-garbage".to_vec(),
                b"second-garbage".to_vec(),
                b"third-garbage".to_vec(),
            ]
        );
    }

    #[test]
    fn corrupt_store_stays_when_copy_fails() {
        let (_dir, store) = store();
        fs::write(store.path(), b"evidence").unwrap();

        store.faults.preserve.store(true, Ordering::SeqCst);
        let err = store.append(descriptor(1.0)).unwrap_err();
        assert!(matches!(err, Error::StorageWriteFailed(_)));
        let err = store.delete_at(1).unwrap_err();
        assert!(matches!(err, Error::StorageWriteFailed(_)));
        store.faults.preserve.store(false, Ordering::SeqCst);

        assert_eq!(fs::read(store.path()).unwrap(), b"evidence");
        assert!(corrupt_copies(&store).is_empty());
    }

    #[test]
    fn unreadable_store_is_not_overwritten() {
        let (_dir, store) = store();
        store.append(descriptor(1.0)).unwrap();
        store.append(descriptor(2.0)).unwrap();
        let before = fs::read(store.path()).unwrap();

        store.faults.read.store(true, Ordering::SeqCst);
        let loaded = store.load_all();
        assert!(loaded.descriptors.is_empty());
        assert!(matches!(loaded.warning, Some(Error::StorageReadCorrupt(_))));

        let err = store.append(descriptor(3.0)).unwrap_err();
        assert!(matches!(err, Error::StorageWriteFailed(_)));
        let err = store.delete_at(1).unwrap_err();
        assert!(matches!(err, Error::StorageWriteFailed(_)));
        store.faults.read.store(false, Ordering::SeqCst);

        assert_eq!(fs::read(store.path()).unwrap(), before);
        assert!(corrupt_copies(&store).is_empty());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn store_path_that_is_a_directory_is_left_alone() {
        let (_dir, store) = store();
        fs::create_dir(store.path()).unwrap();

        assert!(store.load_all().warning.is_some());
        assert!(matches!(
            store.append(descriptor(1.0)),
            Err(Error::StorageWriteFailed(_))
        ));
        assert!(store.path().is_dir());
    }

    #[test]
    fn failed_write_leaves_previous_sequence() {
        let (dir, store) = store();
        store.append(descriptor(1.0)).unwrap();
        store.append(descriptor(2.0)).unwrap();
        let before = store.load_all();

        store.faults.write.store(true, Ordering::SeqCst);
        let err = store.append(descriptor(3.0)).unwrap_err();
        assert!(matches!(err, Error::StorageWriteFailed(_)));
        let err = store.delete_at(1).unwrap_err();
        assert!(matches!(err, Error::StorageWriteFailed(_)));
        store.faults.write.store(false, Ordering::SeqCst);

        assert_eq!(store.load_all(), before);
        // No half-written temporaries left behind.
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn mismatched_length_is_refused() {
        let (_dir, store) = store();
        store.append(descriptor(1.0)).unwrap();
        let err = store
            .append(Descriptor::new(vec![0.0; 64]))
            .unwrap_err();
        assert!(matches!(err, Error::StorageWriteFailed(_)));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn concurrent_appends_all_land() {
        let (_dir, store) = store();
        let store = Arc::new(store);

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for i in 0..5 {
                        store.append(descriptor(t as f32 * 10.0 + i as f32)).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let loaded = store.load_all();
        assert_eq!(loaded.warning, None);
        assert_eq!(loaded.descriptors.len(), 40);
    }

    #[test]
    fn creates_missing_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = DescriptorStore::open(dir.path().join("a").join("b").join("store.bin"));
        assert_eq!(store.append(descriptor(1.0)).unwrap(), 1);
        assert_eq!(store.len(), 1);
    }
}

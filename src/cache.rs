//! Convolution-function families and the geometry-keyed cache that holds
//! them for the lifetime of a gridding session.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::sync::Arc;

use log::debug;
use ndarray::{Array3, ArrayView2, Axis};
use num_complex::Complex32;
use rustfft::num_traits::Zero;
use serde::{Deserialize, Serialize};

use crate::error::CacheIoError;
use crate::geometry::GeometryKey;
use crate::wplane::WScale;

/// One kernel per w-plane. Only the quadrant with non-negative offsets is
/// stored, shaped `(plane, y, x)` with side `conv_size / 2 - 1`; offsets in
/// the other quadrants are reflected into it by absolute value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConvolutionFunctionFamily {
    pub kernels: Array3<Complex32>,
    /// Support radius of each plane in grid pixels.
    pub support: Vec<usize>,
    pub conv_size: usize,
    pub conv_sampling: usize,
    /// Largest w (wavelengths) represented by the planes.
    pub w_scaler: f64,
}

impl ConvolutionFunctionFamily {
    pub fn planes(&self) -> usize {
        self.kernels.len_of(Axis(0))
    }

    pub fn w_scale(&self) -> WScale {
        WScale::new(self.planes(), self.w_scaler)
    }

    pub fn kernel(&self, plane: usize) -> ArrayView2<'_, Complex32> {
        self.kernels.index_axis(Axis(0), plane)
    }

    /// Kernel value at an oversampled offset, zero beyond the stored quadrant.
    #[inline]
    pub fn tap(&self, plane: usize, dy: isize, dx: isize) -> Complex32 {
        let (_, ny, nx) = self.kernels.dim();
        let (y, x) = (dy.unsigned_abs(), dx.unsigned_abs());
        if y < ny && x < nx {
            self.kernels[[plane, y, x]]
        } else {
            Complex32::zero()
        }
    }
}

pub enum CacheLookup {
    /// The family for this geometry was already computed.
    Hit(Arc<ConvolutionFunctionFamily>),
    /// Nothing cached yet; the family belongs in this slot.
    Miss(usize),
}

#[derive(Default)]
pub struct ConvFuncCache {
    slots: HashMap<GeometryKey, usize>,
    families: Vec<Option<Arc<ConvolutionFunctionFamily>>>,
    computations: usize,
}

impl ConvFuncCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached family for `key`, or reserve a slot for it. A slot
    /// whose computation never completed is handed out again.
    pub fn lookup_or_reserve(&mut self, key: GeometryKey) -> CacheLookup {
        if let Some(&slot) = self.slots.get(&key) {
            return match &self.families[slot] {
                Some(family) => CacheLookup::Hit(Arc::clone(family)),
                None => CacheLookup::Miss(slot),
            };
        }

        let slot = self.families.len();
        self.families.push(None);
        self.slots.insert(key, slot);
        debug!("Reserved convolution function slot {} for {}", slot, key);
        CacheLookup::Miss(slot)
    }

    /// Store a freshly computed family.
    pub fn insert(
        &mut self,
        slot: usize,
        family: ConvolutionFunctionFamily,
    ) -> Arc<ConvolutionFunctionFamily> {
        if slot >= self.families.len() {
            self.families.resize(slot + 1, None);
        }
        let family = Arc::new(family);
        self.families[slot] = Some(Arc::clone(&family));
        self.computations += 1;
        family
    }

    pub fn get(&self, key: &GeometryKey) -> Option<Arc<ConvolutionFunctionFamily>> {
        self.slots
            .get(key)
            .and_then(|&slot| self.families[slot].clone())
    }

    /// Number of completed families.
    pub fn len(&self) -> usize {
        self.families.iter().filter(|f| f.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How many families were computed (not reloaded) by this cache.
    pub fn computations(&self) -> usize {
        self.computations
    }

    /// Completed families in slot order.
    pub fn entries(&self) -> Vec<(GeometryKey, usize, Arc<ConvolutionFunctionFamily>)> {
        let mut entries: Vec<_> = self
            .slots
            .iter()
            .filter_map(|(&key, &slot)| {
                self.families[slot]
                    .as_ref()
                    .map(|family| (key, slot, Arc::clone(family)))
            })
            .collect();
        entries.sort_by_key(|&(_, slot, _)| slot);
        entries
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PersistedFamily {
    pub key: GeometryKey,
    pub slot: usize,
    pub family: ConvolutionFunctionFamily,
}

/// On-disk form of a [`ConvFuncCache`] and the generator state around it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub num_conv: usize,
    pub families: Vec<PersistedFamily>,
    pub w_scaler: f64,
    pub conv_sampling: usize,
    pub nx: usize,
    pub ny: usize,
}

impl CacheRecord {
    pub fn write_json<P: AsRef<Path>>(&self, path: P) -> Result<(), CacheIoError> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|source| CacheIoError::IO {
            file: path.to_path_buf(),
            source,
        })?;
        serde_json::to_writer(BufWriter::new(file), self).map_err(|source| CacheIoError::Json {
            file: path.to_path_buf(),
            source,
        })
    }

    pub fn read_json<P: AsRef<Path>>(path: P) -> Result<Self, CacheIoError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| CacheIoError::IO {
            file: path.to_path_buf(),
            source,
        })?;
        let record: CacheRecord =
            serde_json::from_reader(BufReader::new(file)).map_err(|source| CacheIoError::Json {
                file: path.to_path_buf(),
                source,
            })?;
        record.validate()?;
        Ok(record)
    }

    pub fn validate(&self) -> Result<(), CacheIoError> {
        if self.num_conv != self.families.len() {
            return Err(CacheIoError::Inconsistent {
                listed: self.num_conv,
                held: self.families.len(),
            });
        }
        for f in &self.families {
            if f.family.support.len() != f.family.planes() {
                return Err(CacheIoError::SupportLength {
                    slot: f.slot,
                    planes: f.family.planes(),
                    supports: f.family.support.len(),
                });
            }
        }
        Ok(())
    }

    pub fn into_cache(self) -> Result<ConvFuncCache, CacheIoError> {
        self.validate()?;
        let mut cache = ConvFuncCache::new();
        for persisted in self.families {
            if persisted.slot >= cache.families.len() {
                cache.families.resize(persisted.slot + 1, None);
            }
            cache.slots.insert(persisted.key, persisted.slot);
            cache.families[persisted.slot] = Some(Arc::new(persisted.family));
        }
        Ok(cache)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::ImageGeometry;

    fn family(planes: usize, side: usize) -> ConvolutionFunctionFamily {
        ConvolutionFunctionFamily {
            kernels: Array3::from_shape_fn((planes, side, side), |(p, y, x)| {
                Complex32::new(1.0 / (1 + p + y + x) as f32, 0.1 * p as f32 - 0.01 * x as f32)
            }),
            support: vec![2; planes],
            conv_size: 2 * (side + 1),
            conv_sampling: 4,
            w_scaler: 1234.5,
        }
    }

    #[test]
    fn reserve_then_hit() {
        let mut cache = ConvFuncCache::new();
        let a = ImageGeometry::square(256, 1e-5).key(6);
        let b = ImageGeometry::square(128, 1e-5).key(6);

        let slot_a = match cache.lookup_or_reserve(a) {
            CacheLookup::Miss(slot) => slot,
            CacheLookup::Hit(_) => panic!("empty cache hit"),
        };
        // not yet filled, same slot comes back
        assert!(matches!(cache.lookup_or_reserve(a), CacheLookup::Miss(s) if s == slot_a));
        cache.insert(slot_a, family(3, 5));

        let slot_b = match cache.lookup_or_reserve(b) {
            CacheLookup::Miss(slot) => slot,
            CacheLookup::Hit(_) => panic!("different geometry hit"),
        };
        assert_ne!(slot_a, slot_b);
        cache.insert(slot_b, family(1, 7));

        match cache.lookup_or_reserve(a) {
            CacheLookup::Hit(f) => assert_eq!(f.planes(), 3),
            CacheLookup::Miss(_) => panic!("expected a hit"),
        }
        assert_eq!(cache.get(&b).map(|f| f.planes()), Some(1));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.computations(), 2);
    }

    #[test]
    fn taps_reflect_into_stored_quadrant() {
        let f = family(2, 5);
        assert_eq!(f.tap(1, -3, 2), f.kernels[[1, 3, 2]]);
        assert_eq!(f.tap(1, 3, -2), f.kernels[[1, 3, 2]]);
        assert_eq!(f.tap(0, 5, 0), Complex32::zero());
        assert_eq!(f.tap(0, 0, -5), Complex32::zero());
    }

    #[test]
    fn kernel_views_one_plane() {
        let f = family(3, 4);
        let plane = f.kernel(2);
        assert_eq!(plane.dim(), (4, 4));
        assert_eq!(plane[[1, 3]], f.kernels[[2, 1, 3]]);
        assert_eq!(plane[[3, 0]], f.tap(2, -3, 0));
    }

    #[test]
    fn record_round_trip() {
        let mut cache = ConvFuncCache::new();
        let key = ImageGeometry::square(64, 2e-4).key(6);
        if let CacheLookup::Miss(slot) = cache.lookup_or_reserve(key) {
            cache.insert(slot, family(3, 6));
        }
        let record = CacheRecord {
            num_conv: 1,
            families: cache
                .entries()
                .into_iter()
                .map(|(key, slot, family)| PersistedFamily {
                    key,
                    slot,
                    family: (*family).clone(),
                })
                .collect(),
            w_scaler: 1234.5,
            conv_sampling: 4,
            nx: 64,
            ny: 64,
        };

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        record.write_json(&path).unwrap();
        let read = CacheRecord::read_json(&path).unwrap();
        assert_eq!(read, record);

        let restored = read.into_cache().unwrap();
        assert_eq!(restored.get(&key).as_deref(), Some(&family(3, 6)));
        assert_eq!(restored.computations(), 0);
    }

    #[test]
    fn inconsistent_record() {
        let mut record = CacheRecord {
            num_conv: 2,
            families: vec![],
            w_scaler: 0.0,
            conv_sampling: 1,
            nx: 8,
            ny: 8,
        };
        assert!(matches!(
            record.validate(),
            Err(CacheIoError::Inconsistent { listed: 2, held: 0 })
        ));

        let mut f = family(3, 4);
        f.support.pop();
        record.num_conv = 1;
        record.families.push(PersistedFamily {
            key: ImageGeometry::square(8, 1e-3).key(6),
            slot: 0,
            family: f,
        });
        assert!(matches!(
            record.into_cache(),
            Err(CacheIoError::SupportLength { planes: 3, supports: 2, .. })
        ));
    }
}

use core::fmt;
use std::collections::HashMap;
use std::sync::Arc;

/// Wavenumber window (cm⁻¹) synthesized separately for one compound.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpectralBound {
    pub lower: f64,
    pub upper: f64,
}

impl SpectralBound {
    pub fn new(lower: f64, upper: f64) -> Self {
        Self { lower, upper }
    }

    pub fn width(&self) -> f64 {
        self.upper - self.lower
    }
}

/// Fixed inputs handed to the synthesizer alongside pressure and temperature.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisParams {
    pub isotope: String,
    pub mole_fraction: f64,
    pub path_length_cm: f64,
    /// Gaussian instrument slit FWHM in cm⁻¹.
    pub slit_cm: f64,
}

impl Default for SynthesisParams {
    fn default() -> Self {
        Self {
            isotope: "1".to_string(),
            mole_fraction: 1e-6,
            path_length_cm: 500.0,
            slit_cm: 0.241,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Compound {
    pub id: String,
    pub bounds: Vec<SpectralBound>,
    /// Line-list tag understood by the synthesizer.
    pub source: String,
    pub synthesis: SynthesisParams,
}

impl Compound {
    pub fn new(id: impl Into<String>, source: impl Into<String>, bounds: Vec<SpectralBound>) -> Self {
        Self {
            id: id.into(),
            bounds,
            source: source.into(),
            synthesis: SynthesisParams::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    DuplicateId(String),
    UnknownId(String),
    /// A mask or id list does not line up with the active set.
    MaskLength { expected: usize, actual: usize },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateId(id) => write!(f, "compound {id:?} registered twice"),
            Self::UnknownId(id) => write!(f, "unknown compound {id:?}"),
            Self::MaskLength { expected, actual } => {
                write!(f, "mask has {actual} entries for {expected} active compounds")
            }
        }
    }
}

impl std::error::Error for RegistryError {}

/// Ordered, immutable identifier → compound mapping.
#[derive(Debug, Clone)]
pub struct CompoundRegistry {
    compounds: Vec<Compound>,
    index: HashMap<String, usize>,
}

impl CompoundRegistry {
    pub fn new(compounds: Vec<Compound>) -> Result<Self, RegistryError> {
        let mut index = HashMap::with_capacity(compounds.len());
        for (i, c) in compounds.iter().enumerate() {
            if index.insert(c.id.clone(), i).is_some() {
                return Err(RegistryError::DuplicateId(c.id.clone()));
            }
        }
        Ok(Self { compounds, index })
    }

    pub fn len(&self) -> usize {
        self.compounds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.compounds.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Compound> {
        self.index.get(id).map(|&i| &self.compounds[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Compound> {
        self.compounds.iter()
    }
}

/// Live subset of a shared registry, in registry order.
#[derive(Debug, Clone)]
pub struct ActiveCompounds {
    registry: Arc<CompoundRegistry>,
    active: Vec<usize>,
}

impl ActiveCompounds {
    pub fn all(registry: Arc<CompoundRegistry>) -> Self {
        let active = (0..registry.len()).collect();
        Self { registry, active }
    }

    pub fn from_ids<S: AsRef<str>>(
        registry: Arc<CompoundRegistry>,
        ids: &[S],
    ) -> Result<Self, RegistryError> {
        let mut active = Vec::with_capacity(ids.len());
        for id in ids {
            let id = id.as_ref();
            let i = *registry
                .index
                .get(id)
                .ok_or_else(|| RegistryError::UnknownId(id.to_string()))?;
            if active.contains(&i) {
                return Err(RegistryError::DuplicateId(id.to_string()));
            }
            active.push(i);
        }
        active.sort_unstable();
        Ok(Self { registry, active })
    }

    pub fn registry(&self) -> &Arc<CompoundRegistry> {
        &self.registry
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.iter().map(|c| c.id.as_str()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Compound> {
        self.active.iter().map(|&i| &self.registry.compounds[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.registry
            .index
            .get(id)
            .map_or(false, |i| self.active.contains(i))
    }

    /// Keeps the compounds whose `keep` flag is set; `keep` follows `ids()` order.
    pub fn narrow(&self, keep: &[bool]) -> Result<Self, RegistryError> {
        if keep.len() != self.active.len() {
            return Err(RegistryError::MaskLength {
                expected: self.active.len(),
                actual: keep.len(),
            });
        }
        let active = self
            .active
            .iter()
            .zip(keep)
            .filter_map(|(&i, &k)| k.then_some(i))
            .collect();
        Ok(Self {
            registry: Arc::clone(&self.registry),
            active,
        })
    }

    pub fn without<S: AsRef<str>>(&self, ids: &[S]) -> Self {
        let drop: Vec<usize> = ids
            .iter()
            .filter_map(|id| self.registry.index.get(id.as_ref()).copied())
            .collect();
        Self {
            registry: Arc::clone(&self.registry),
            active: self
                .active
                .iter()
                .copied()
                .filter(|i| !drop.contains(i))
                .collect(),
        }
    }
}

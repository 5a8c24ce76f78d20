//! Pseudo-random sources owned by a training run.
//!
//! A run draws from several independent generators: a general-purpose one
//! (sampling decisions), one for array-shaped draws (shuffles, noise
//! tensors), one for compute-side initialisation, and optionally one bound
//! to an accelerator device. All of them are captured in every checkpoint so
//! that a resumed run replays exactly the draws an uninterrupted run would.

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

const GENERAL_STREAM: u64 = 0;
const ARRAY_STREAM: u64 = 1;
const COMPUTE_STREAM: u64 = 2;
const DEVICE_STREAM: u64 = 3;

/// Exact position of one ChaCha generator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratorState {
    pub seed: [u8; 32],
    pub stream: u64,
    #[serde(with = "u128_string")]
    pub word_pos: u128,
}

impl GeneratorState {
    fn capture(rng: &ChaCha8Rng) -> Self {
        GeneratorState {
            seed: rng.get_seed(),
            stream: rng.get_stream(),
            word_pos: rng.get_word_pos(),
        }
    }

    fn rebuild(&self) -> ChaCha8Rng {
        let mut rng = ChaCha8Rng::from_seed(self.seed);
        rng.set_stream(self.stream);
        rng.set_word_pos(self.word_pos);
        rng
    }
}

/// Snapshot of every source in a [`RandomSources`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RngState {
    pub general: GeneratorState,
    pub array: GeneratorState,
    pub compute: GeneratorState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<GeneratorState>,
}

#[derive(Debug, Clone)]
pub struct RandomSources {
    general: ChaCha8Rng,
    array: ChaCha8Rng,
    compute: ChaCha8Rng,
    device: Option<ChaCha8Rng>,
}

impl RandomSources {
    /// Deterministic sources; every generator shares the seed on its own stream.
    pub fn seeded(seed: u64) -> Self {
        let stream = |n| {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            rng.set_stream(n);
            rng
        };
        RandomSources {
            general: stream(GENERAL_STREAM),
            array: stream(ARRAY_STREAM),
            compute: stream(COMPUTE_STREAM),
            device: None,
        }
    }

    /// Activate the accelerator-bound source, derived from the compute source.
    pub fn with_device(mut self) -> Self {
        let mut device = ChaCha8Rng::from_seed(self.compute.get_seed());
        device.set_stream(DEVICE_STREAM);
        self.device = Some(device);
        self
    }

    pub fn general(&mut self) -> &mut ChaCha8Rng {
        &mut self.general
    }

    pub fn array(&mut self) -> &mut ChaCha8Rng {
        &mut self.array
    }

    pub fn compute(&mut self) -> &mut ChaCha8Rng {
        &mut self.compute
    }

    pub fn device(&mut self) -> Option<&mut ChaCha8Rng> {
        self.device.as_mut()
    }

    pub fn snapshot(&self) -> RngState {
        RngState {
            general: GeneratorState::capture(&self.general),
            array: GeneratorState::capture(&self.array),
            compute: GeneratorState::capture(&self.compute),
            device: self.device.as_ref().map(GeneratorState::capture),
        }
    }

    /// Restore a snapshot. The device source is restored only when it is
    /// active here and was captured in the snapshot.
    pub fn restore(&mut self, state: &RngState) {
        self.general = state.general.rebuild();
        self.array = state.array.rebuild();
        self.compute = state.compute.rebuild();
        if let (Some(device), Some(saved)) = (self.device.as_mut(), state.device.as_ref()) {
            *device = saved.rebuild();
        }
    }
}

// JSON numbers cannot carry a full u128.
mod u128_string {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

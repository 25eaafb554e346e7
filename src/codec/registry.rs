//! Tag registry for shipping runners between nodes.
//!
//! A runner travels the wire as a [`TaggedRunner`]: a registered tag plus
//! the runner's own serialized body. The registry maps tags back to decode
//! functions, replacing dynamic object-graph serialization with an
//! explicit, strongly-typed table. Hosts register their own transportable
//! runners with [`register`]; the built-in runners are registered lazily.

use std::collections::HashMap;
use std::sync::{Once, RwLock};

use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::runner::Runner;

/// The wire form of a transportable runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaggedRunner {
  /// Registered tag identifying the runner type.
  pub tag: String,
  /// The runner's serialized configuration.
  pub body: serde_json::Value,
}

impl TaggedRunner {
  /// Encodes a runner under its tag.
  pub fn encode<R: Runner + Serialize>(tag: &str, runner: &R) -> Result<Self> {
    Ok(Self {
      tag: tag.to_string(),
      body: serde_json::to_value(runner)?,
    })
  }
}

/// A runner type that can be shipped to peers.
///
/// Implementors also override [`Runner::wire`] to return
/// `TaggedRunner::encode(Self::WIRE_TAG, self)` and are announced to the
/// registry with [`register`].
pub trait WireRunner: Runner + Serialize + DeserializeOwned + Sized + 'static {
  /// The registered wire tag for this runner type.
  const WIRE_TAG: &'static str;
}

type DecodeFn = fn(serde_json::Value) -> Result<Arc<dyn Runner>>;

static RUNNER_TAGS: Lazy<RwLock<HashMap<String, DecodeFn>>> =
  Lazy::new(|| RwLock::new(HashMap::new()));

fn decode_as<R: WireRunner>(body: serde_json::Value) -> Result<Arc<dyn Runner>> {
  Ok(Arc::new(serde_json::from_value::<R>(body)?))
}

/// Registers a runner type for wire transport. Idempotent.
pub fn register<R: WireRunner>() {
  let mut tags = RUNNER_TAGS
    .write()
    .unwrap_or_else(|poisoned| poisoned.into_inner());
  tags.insert(R::WIRE_TAG.to_string(), decode_as::<R>);
}

/// Reconstructs a runner from its wire form.
pub fn decode_runner(tagged: &TaggedRunner) -> Result<Arc<dyn Runner>> {
  register_builtin();
  let decode = {
    let tags = RUNNER_TAGS
      .read()
      .unwrap_or_else(|poisoned| poisoned.into_inner());
    tags
      .get(&tagged.tag)
      .copied()
      .ok_or_else(|| Error::UnknownWireTag(tagged.tag.clone()))?
  };
  decode(tagged.body.clone())
}

static BUILTIN: Once = Once::new();

/// Registers the crate's own transportable runners.
pub fn register_builtin() {
  BUILTIN.call_once(|| {
    register::<crate::runner::PassThrough>();
    register::<crate::exchange::Exchange>();
    register::<crate::pipeline::Pipeline>();
    register::<crate::project::Project>();
  });
}

/// Serde adapter for `Arc<dyn Runner>` fields of transportable runners.
///
/// Use as `#[serde(with = "crate::codec::wire_runner")]`.
pub mod wire_runner {
  use super::*;
  use serde::{Deserializer, Serializer};

  pub fn serialize<S: Serializer>(
    runner: &Arc<dyn Runner>,
    serializer: S,
  ) -> std::result::Result<S::Ok, S::Error> {
    let tagged = runner.wire().map_err(serde::ser::Error::custom)?;
    tagged.serialize(serializer)
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(
    deserializer: D,
  ) -> std::result::Result<Arc<dyn Runner>, D::Error> {
    let tagged = TaggedRunner::deserialize(deserializer)?;
    decode_runner(&tagged).map_err(serde::de::Error::custom)
  }
}

/// Serde adapter for `Vec<Arc<dyn Runner>>` fields of transportable
/// runners.
///
/// Use as `#[serde(with = "crate::codec::wire_runners")]`.
pub mod wire_runners {
  use super::*;
  use serde::{Deserializer, Serializer};

  pub fn serialize<S: Serializer>(
    runners: &[Arc<dyn Runner>],
    serializer: S,
  ) -> std::result::Result<S::Ok, S::Error> {
    let tagged = runners
      .iter()
      .map(|r| r.wire())
      .collect::<Result<Vec<_>>>()
      .map_err(serde::ser::Error::custom)?;
    tagged.serialize(serializer)
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(
    deserializer: D,
  ) -> std::result::Result<Vec<Arc<dyn Runner>>, D::Error> {
    let tagged = Vec::<TaggedRunner>::deserialize(deserializer)?;
    tagged
      .iter()
      .map(|t| decode_runner(t).map_err(serde::de::Error::custom))
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::runner::PassThrough;

  #[test]
  fn pass_through_round_trips_through_the_registry() {
    register_builtin();
    let tagged = PassThrough.wire().unwrap();
    assert_eq!(tagged.tag, PassThrough::WIRE_TAG);
    let decoded = decode_runner(&tagged).unwrap();
    assert_eq!(decoded.returns(), PassThrough.returns());
  }

  #[test]
  fn unknown_tag_is_rejected() {
    let tagged = TaggedRunner {
      tag: "no-such-runner".into(),
      body: serde_json::Value::Null,
    };
    assert!(matches!(
      decode_runner(&tagged),
      Err(Error::UnknownWireTag(tag)) if tag == "no-such-runner"
    ));
  }
}

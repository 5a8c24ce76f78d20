use std::collections::BTreeMap;

use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use serde::{Serialize, Serializer};

/// Metric dictionary produced per batch and per epoch.
pub type Metrics = BTreeMap<String, MetricValue>;

/// A metric as returned by a metrics calculator.
///
/// `Array` is a dense host array and is never collapsed. `Tensor` is
/// compute-side data: after [`normalize`] it only survives when it holds
/// more than one element.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum MetricValue {
    Scalar(f64),
    Int(i64),
    Bool(bool),
    Text(String),
    Array(Vec<f64>),
    Tensor(#[serde(serialize_with = "serialize_tensor")] TensorData),
    List(Vec<MetricValue>),
    Tuple(Vec<MetricValue>),
    Map(Metrics),
}

impl MetricValue {
    /// Plain number, if this value is scalar-like.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetricValue::Scalar(v) => Some(*v),
            MetricValue::Int(v) => Some(*v as f64),
            MetricValue::Tensor(data) if data.num_elements() == 1 => data.iter::<f64>().next(),
            _ => None,
        }
    }
}

/// Reduce a metric to its canonical serializable form.
///
/// Maps, lists and tuples are normalized element-wise, one-element tensors
/// collapse to a plain scalar, everything else is returned unchanged.
pub fn normalize(value: MetricValue) -> MetricValue {
    match value {
        MetricValue::Map(map) => MetricValue::Map(normalize_metrics(map)),
        MetricValue::List(items) => MetricValue::List(items.into_iter().map(normalize).collect()),
        MetricValue::Tuple(items) => {
            MetricValue::Tuple(items.into_iter().map(normalize).collect())
        }
        MetricValue::Tensor(data) if data.num_elements() == 1 => {
            let first = data.iter::<f64>().next();
            match first {
                Some(v) => MetricValue::Scalar(v),
                None => MetricValue::Tensor(data),
            }
        }
        other => other,
    }
}

pub fn normalize_metrics(metrics: Metrics) -> Metrics {
    metrics
        .into_iter()
        .map(|(k, v)| (k, normalize(v)))
        .collect()
}

fn serialize_tensor<S: Serializer>(data: &TensorData, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(data.iter::<f64>())
}

fn tensor_eq(a: &TensorData, b: &TensorData) -> bool {
    a.shape == b.shape && a.iter::<f64>().eq(b.iter::<f64>())
}

impl PartialEq for MetricValue {
    fn eq(&self, other: &Self) -> bool {
        use MetricValue::*;
        match (self, other) {
            (Scalar(a), Scalar(b)) => a == b,
            (Int(a), Int(b)) => a == b,
            (Bool(a), Bool(b)) => a == b,
            (Text(a), Text(b)) => a == b,
            (Array(a), Array(b)) => a == b,
            (Tensor(a), Tensor(b)) => tensor_eq(a, b),
            (List(a), List(b)) | (Tuple(a), Tuple(b)) => a == b,
            (Map(a), Map(b)) => a == b,
            _ => false,
        }
    }
}

impl From<f64> for MetricValue {
    fn from(v: f64) -> Self {
        MetricValue::Scalar(v)
    }
}

impl From<f32> for MetricValue {
    fn from(v: f32) -> Self {
        MetricValue::Scalar(f64::from(v))
    }
}

impl From<i64> for MetricValue {
    fn from(v: i64) -> Self {
        MetricValue::Int(v)
    }
}

impl From<bool> for MetricValue {
    fn from(v: bool) -> Self {
        MetricValue::Bool(v)
    }
}

impl From<&str> for MetricValue {
    fn from(v: &str) -> Self {
        MetricValue::Text(v.to_string())
    }
}

impl From<String> for MetricValue {
    fn from(v: String) -> Self {
        MetricValue::Text(v)
    }
}

impl From<Vec<f64>> for MetricValue {
    fn from(v: Vec<f64>) -> Self {
        MetricValue::Array(v)
    }
}

impl From<TensorData> for MetricValue {
    fn from(data: TensorData) -> Self {
        MetricValue::Tensor(data)
    }
}

/// Reading a tensor back to the host detaches it from any autodiff graph.
impl<B: Backend, const D: usize> From<Tensor<B, D>> for MetricValue {
    fn from(tensor: Tensor<B, D>) -> Self {
        MetricValue::Tensor(tensor.into_data())
    }
}

impl From<Metrics> for MetricValue {
    fn from(map: Metrics) -> Self {
        MetricValue::Map(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MetricValue {
        let mut inner = Metrics::new();
        inner.insert("acc".into(), TensorData::new(vec![0.5f32], [1, 1]).into());
        inner.insert("hist".into(), vec![1.0, 2.0, 3.0].into());
        let mut outer = Metrics::new();
        outer.insert("loss".into(), TensorData::new(vec![0.25f32], [1]).into());
        outer.insert("per_class".into(), TensorData::new(vec![0.1f32, 0.9], [2]).into());
        outer.insert("nested".into(), MetricValue::Map(inner));
        outer.insert(
            "pair".into(),
            MetricValue::Tuple(vec![TensorData::new(vec![2.0f32], [1]).into(), "tag".into()]),
        );
        outer.insert(
            "steps".into(),
            MetricValue::List(vec![1i64.into(), TensorData::new(vec![4.0f32], [1]).into()]),
        );
        MetricValue::Map(outer)
    }

    #[test]
    fn test_single_element_tensor_collapses() {
        let v = normalize(TensorData::new(vec![3.5f32], [1, 1, 1]).into());
        assert_eq!(v, MetricValue::Scalar(3.5));
    }

    #[test]
    fn test_multi_element_tensor_is_kept() {
        let data = TensorData::new(vec![1.0f32, 2.0, 3.0], [3]);
        let v = normalize(data.clone().into());
        assert_eq!(v, MetricValue::Tensor(data));
    }

    #[test]
    fn test_array_passes_through_even_with_one_element() {
        let v = normalize(MetricValue::Array(vec![7.0]));
        assert_eq!(v, MetricValue::Array(vec![7.0]));
    }

    #[test]
    fn test_nested_structures_are_normalized() {
        let MetricValue::Map(map) = normalize(sample()) else {
            panic!("expected a map");
        };
        assert_eq!(map["loss"], MetricValue::Scalar(0.25));
        assert!(matches!(map["per_class"], MetricValue::Tensor(_)));
        let MetricValue::Map(inner) = &map["nested"] else {
            panic!("expected nested map");
        };
        assert_eq!(inner["acc"], MetricValue::Scalar(0.5));
        assert_eq!(inner["hist"], MetricValue::Array(vec![1.0, 2.0, 3.0]));
        assert_eq!(
            map["pair"],
            MetricValue::Tuple(vec![MetricValue::Scalar(2.0), "tag".into()])
        );
        assert_eq!(
            map["steps"],
            MetricValue::List(vec![MetricValue::Int(1), MetricValue::Scalar(4.0)])
        );
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let once = normalize(sample());
        let twice = normalize(once.clone());
        assert_eq!(once, twice);

        for v in [
            MetricValue::Scalar(1.0),
            MetricValue::Text("x".into()),
            MetricValue::Bool(true),
            MetricValue::Array(vec![]),
        ] {
            assert_eq!(normalize(normalize(v.clone())), normalize(v));
        }
    }

    #[test]
    fn test_as_f64() {
        assert_eq!(MetricValue::Int(3).as_f64(), Some(3.0));
        assert_eq!(MetricValue::Text("3".into()).as_f64(), None);
        assert_eq!(MetricValue::Array(vec![1.0]).as_f64(), None);
    }

    #[test]
    fn test_serializes_scalar_safe() {
        let mut m = Metrics::new();
        m.insert("loss".into(), 0.5.into());
        m.insert("t".into(), TensorData::new(vec![1.0f32, 2.0], [2]).into());
        let json = serde_json::to_string(&m).unwrap();
        assert_eq!(json, r#"{"loss":0.5,"t":[1.0,2.0]}"#);
    }
}

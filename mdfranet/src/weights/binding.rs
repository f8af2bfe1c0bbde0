//! Binds checkpoint tensors onto an initialised module by module path.
//!
//! The module's record is walked once to list every parameter under its dotted
//! path. Each checkpoint tensor then replaces the parameter at its path, and the
//! record is rebuilt and loaded back. Parameters the checkpoint does not carry
//! keep the values they had. Checkpoint tensors that match no parameter are
//! skipped.
//!
//! Checkpoint tensors use PyTorch conventions, so `weight`/`bias` of a norm layer
//! bind to `gamma`/`beta` and `Linear` weights are transposed.

use std::collections::{HashMap, HashSet};

use burn::{
    module::Module,
    record::{
        serde::{
            adapter::DefaultAdapter,
            data::{unflatten, NestedValue, Serializable},
            de::Deserializer,
            error::Error as RecordError,
            ser::Serializer as NestedSerializer,
        },
        FullPrecisionSettings, PrecisionSettings, Record,
    },
    tensor::{backend::Backend, TensorData},
};
use serde::{ser, Deserialize, Serialize};

use crate::error::{MdfraError, MdfraResult};

const PARAM_STRUCT: &str = "ParamSerde";
const LINEAR_RECORD: &str = "LinearRecordItem";
const NORM_RECORDS: [&str; 3] = [
    "BatchNormRecordItem",
    "GroupNormRecordItem",
    "LayerNormRecordItem",
];

/// A dense `f32` tensor read from a checkpoint, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointTensor {
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

impl CheckpointTensor {
    /// `[rows, cols]` to `[cols, rows]`; other ranks are returned as they are.
    fn transposed(self) -> Self {
        let [rows, cols] = match self.shape[..] {
            [rows, cols] => [rows, cols],
            _ => return self,
        };

        let mut values = Vec::with_capacity(self.values.len());
        for col in 0..cols {
            for row in 0..rows {
                values.push(self.values[row * cols + col]);
            }
        }

        Self {
            shape: vec![cols, rows],
            values,
        }
    }
}

/// What a binding pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindingReport {
    /// Number of parameters overwritten from the checkpoint.
    pub bound: usize,
    /// Module paths of parameters that kept their initial values, sorted.
    pub missing: Vec<String>,
    /// Checkpoint keys that matched no parameter, sorted.
    pub unused: Vec<String>,
}

/// Overwrite the parameters of `module` found in `tensors`.
///
/// # Errors
///
/// Returns `MdfraError::WeightLoadingFailed` if a tensor's shape differs from the
/// parameter it binds to, or if the record cannot be rebuilt.
pub fn bind<B, M>(
    module: M,
    tensors: HashMap<String, CheckpointTensor>,
    device: &B::Device,
) -> MdfraResult<(M, BindingReport)>
where
    B: Backend,
    M: Module<B>,
{
    let mut params = ModelParams::collect::<B, M>(&module).map_err(record_error)?;
    let mut report = BindingReport::default();
    let mut bound = HashSet::new();

    for (key, tensor) in tensors {
        let path = params.target_path(&key);
        let tensor = if params.is_linear_weight(&path) {
            tensor.transposed()
        } else {
            tensor
        };

        let Some(param) = params.params.get_mut(&path) else {
            report.unused.push(key);
            continue;
        };
        if tensor.shape != param.shape {
            return Err(MdfraError::WeightLoadingFailed {
                reason: format!(
                    "Shape mismatch for {key} (bound to {path}): checkpoint {:?}, model {:?}",
                    tensor.shape, param.shape
                ),
            });
        }

        param.replace(tensor.values);
        bound.insert(path);
    }

    report.bound = bound.len();
    report.missing = params
        .params
        .keys()
        .filter(|path| !bound.contains(*path))
        .cloned()
        .collect();
    report.missing.sort();
    report.unused.sort();

    let leaves: HashMap<String, Leaf> = params
        .params
        .into_iter()
        .map(|(path, param)| (path, Leaf(param.value)))
        .collect();
    let tree = unflatten::<FullPrecisionSettings, _>(leaves).map_err(record_error)?;
    let record = record_from_tree::<B, M::Record>(tree, device).map_err(record_error)?;

    Ok((module.load_record(record), report))
}

fn record_from_tree<B: Backend, R: Record<B>>(
    tree: NestedValue,
    device: &B::Device,
) -> Result<R, RecordError> {
    let deserializer = Deserializer::<DefaultAdapter>::new(tree, true);
    let item = <R::Item<FullPrecisionSettings> as Deserialize>::deserialize(deserializer)?;

    Ok(R::from_item::<FullPrecisionSettings>(item, device))
}

fn record_error(error: RecordError) -> MdfraError {
    MdfraError::WeightLoadingFailed {
        reason: format!("Record binding failed: {error}"),
    }
}

/// A parameter as burn serializes it (`{ id, param: { bytes, shape, dtype } }`).
struct ModelParam {
    value: NestedValue,
    shape: Vec<usize>,
}

impl ModelParam {
    fn from_fields(fields: HashMap<String, NestedValue>) -> Result<Self, RecordError> {
        let shape = match fields.get("param") {
            Some(NestedValue::Map(param)) => match param.get("shape") {
                Some(NestedValue::Vec(dims)) => dims
                    .iter()
                    .map(|dim| dim.clone().as_u64().map(|dim| dim as usize))
                    .collect::<Option<Vec<_>>>(),
                _ => None,
            },
            _ => None,
        };

        let shape = shape.ok_or_else(|| RecordError::Other("parameter without a shape".into()))?;
        Ok(Self {
            value: NestedValue::Map(fields),
            shape,
        })
    }

    fn replace(&mut self, values: Vec<f32>) {
        if let NestedValue::Map(fields) = &mut self.value {
            if let Some(NestedValue::Map(param)) = fields.get_mut("param") {
                let data = TensorData::new(values, self.shape.clone());
                param.insert("bytes".to_string(), NestedValue::Bytes(data.into_bytes()));
            }
        }
    }

    #[cfg(test)]
    fn values(&self) -> Option<Vec<f32>> {
        let NestedValue::Map(fields) = &self.value else {
            return None;
        };
        let Some(NestedValue::Map(param)) = fields.get("param") else {
            return None;
        };
        let bytes = param.get("bytes")?.clone().as_bytes()?;

        Some(
            bytes
                .chunks_exact(4)
                .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
                .collect(),
        )
    }
}

/// Every parameter of a module by dotted path, plus the record type at each path.
#[derive(Default)]
struct ModelParams {
    params: HashMap<String, ModelParam>,
    kinds: HashMap<String, &'static str>,
}

impl ModelParams {
    fn collect<B: Backend, M: Module<B>>(module: &M) -> Result<Self, RecordError> {
        let item = module
            .clone()
            .into_record()
            .into_item::<FullPrecisionSettings>();

        let mut params = Self::default();
        item.serialize(ParamCollector {
            path: String::new(),
            params: &mut params,
        })?;
        Ok(params)
    }

    /// Module path a checkpoint key binds to.
    fn target_path(&self, key: &str) -> String {
        let Some((parent, leaf)) = key.rsplit_once('.') else {
            return key.to_string();
        };
        let is_norm = self
            .kinds
            .get(parent)
            .is_some_and(|kind| NORM_RECORDS.contains(kind));

        match leaf {
            "weight" if is_norm => format!("{parent}.gamma"),
            "bias" if is_norm => format!("{parent}.beta"),
            _ => key.to_string(),
        }
    }

    fn is_linear_weight(&self, path: &str) -> bool {
        path.rsplit_once('.').is_some_and(|(parent, leaf)| {
            leaf == "weight" && self.kinds.get(parent) == Some(&LINEAR_RECORD)
        })
    }
}

fn child_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}.{name}")
    }
}

struct Leaf(NestedValue);

impl Serializable for Leaf {
    fn serialize<PS>(&self, _serializer: NestedSerializer) -> Result<NestedValue, RecordError>
    where
        PS: PrecisionSettings,
    {
        Ok(self.0.clone())
    }
}

/// Walks a record item, registering each `ParamSerde` under its path.
///
/// Enum variants and `Option`s do not add a path segment, matching how the
/// record deserializer reads them back.
struct ParamCollector<'a> {
    path: String,
    params: &'a mut ModelParams,
}

struct SeqCollector<'a> {
    path: String,
    params: &'a mut ModelParams,
    index: usize,
}

struct StructCollector<'a> {
    path: String,
    params: &'a mut ModelParams,
    leaf: Option<HashMap<String, NestedValue>>,
}

macro_rules! skip_values {
    ($($method:ident($ty:ty)),* $(,)?) => {
        $(
            fn $method(self, _value: $ty) -> Result<(), RecordError> {
                Ok(())
            }
        )*
    };
}

impl<'a> ser::Serializer for ParamCollector<'a> {
    type Ok = ();
    type Error = RecordError;
    type SerializeSeq = SeqCollector<'a>;
    type SerializeTuple = SeqCollector<'a>;
    type SerializeTupleStruct = SeqCollector<'a>;
    type SerializeTupleVariant = SeqCollector<'a>;
    type SerializeMap = ser::Impossible<(), RecordError>;
    type SerializeStruct = StructCollector<'a>;
    type SerializeStructVariant = StructCollector<'a>;

    skip_values!(
        serialize_bool(bool),
        serialize_i8(i8),
        serialize_i16(i16),
        serialize_i32(i32),
        serialize_i64(i64),
        serialize_u8(u8),
        serialize_u16(u16),
        serialize_u32(u32),
        serialize_u64(u64),
        serialize_f32(f32),
        serialize_f64(f64),
        serialize_char(char),
        serialize_str(&str),
        serialize_bytes(&[u8]),
        serialize_unit_struct(&'static str),
    );

    fn serialize_none(self) -> Result<(), RecordError> {
        Ok(())
    }

    fn serialize_some<T: Serialize + ?Sized>(self, value: &T) -> Result<(), RecordError> {
        value.serialize(self)
    }

    fn serialize_unit(self) -> Result<(), RecordError> {
        Ok(())
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
    ) -> Result<(), RecordError> {
        Ok(())
    }

    fn serialize_newtype_struct<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        value: &T,
    ) -> Result<(), RecordError> {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        value: &T,
    ) -> Result<(), RecordError> {
        value.serialize(self)
    }

    fn serialize_seq(self, _len: Option<usize>) -> Result<SeqCollector<'a>, RecordError> {
        Ok(SeqCollector {
            path: self.path,
            params: self.params,
            index: 0,
        })
    }

    fn serialize_tuple(self, len: usize) -> Result<SeqCollector<'a>, RecordError> {
        self.serialize_seq(Some(len))
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        len: usize,
    ) -> Result<SeqCollector<'a>, RecordError> {
        self.serialize_seq(Some(len))
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        len: usize,
    ) -> Result<SeqCollector<'a>, RecordError> {
        self.serialize_seq(Some(len))
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<Self::SerializeMap, RecordError> {
        Err(ser::Error::custom(format!(
            "map records are not supported (at '{}')",
            self.path
        )))
    }

    fn serialize_struct(
        self,
        name: &'static str,
        _len: usize,
    ) -> Result<StructCollector<'a>, RecordError> {
        let leaf = (name == PARAM_STRUCT).then(HashMap::new);
        if leaf.is_none() {
            self.params.kinds.insert(self.path.clone(), name);
        }

        Ok(StructCollector {
            path: self.path,
            params: self.params,
            leaf,
        })
    }

    fn serialize_struct_variant(
        self,
        name: &'static str,
        _index: u32,
        _variant: &'static str,
        len: usize,
    ) -> Result<StructCollector<'a>, RecordError> {
        self.serialize_struct(name, len)
    }
}

impl SeqCollector<'_> {
    fn element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), RecordError> {
        let path = child_path(&self.path, &self.index.to_string());
        self.index += 1;
        value.serialize(ParamCollector {
            path,
            params: &mut *self.params,
        })
    }
}

impl ser::SerializeSeq for SeqCollector<'_> {
    type Ok = ();
    type Error = RecordError;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), RecordError> {
        self.element(value)
    }

    fn end(self) -> Result<(), RecordError> {
        Ok(())
    }
}

impl ser::SerializeTuple for SeqCollector<'_> {
    type Ok = ();
    type Error = RecordError;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), RecordError> {
        self.element(value)
    }

    fn end(self) -> Result<(), RecordError> {
        Ok(())
    }
}

impl ser::SerializeTupleStruct for SeqCollector<'_> {
    type Ok = ();
    type Error = RecordError;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), RecordError> {
        self.element(value)
    }

    fn end(self) -> Result<(), RecordError> {
        Ok(())
    }
}

impl ser::SerializeTupleVariant for SeqCollector<'_> {
    type Ok = ();
    type Error = RecordError;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), RecordError> {
        self.element(value)
    }

    fn end(self) -> Result<(), RecordError> {
        Ok(())
    }
}

impl StructCollector<'_> {
    fn field<T: Serialize + ?Sized>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<(), RecordError> {
        match &mut self.leaf {
            Some(fields) => {
                fields.insert(key.to_string(), value.serialize(NestedSerializer::new())?);
                Ok(())
            }
            None => value.serialize(ParamCollector {
                path: child_path(&self.path, key),
                params: &mut *self.params,
            }),
        }
    }

    fn finish(self) -> Result<(), RecordError> {
        if let Some(fields) = self.leaf {
            let param = ModelParam::from_fields(fields)?;
            self.params.params.insert(self.path, param);
        }
        Ok(())
    }
}

impl ser::SerializeStruct for StructCollector<'_> {
    type Ok = ();
    type Error = RecordError;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<(), RecordError> {
        self.field(key, value)
    }

    fn end(self) -> Result<(), RecordError> {
        self.finish()
    }
}

impl ser::SerializeStructVariant for StructCollector<'_> {
    type Ok = ();
    type Error = RecordError;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<(), RecordError> {
        self.field(key, value)
    }

    fn end(self) -> Result<(), RecordError> {
        self.finish()
    }
}

/// Current values of the parameter at `path`, if `module` has one there.
#[cfg(test)]
pub(crate) fn param_values<B: Backend, M: Module<B>>(module: &M, path: &str) -> Option<Vec<f32>> {
    ModelParams::collect::<B, M>(module)
        .ok()?
        .params
        .get(path)?
        .values()
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::{
        backend::NdArray,
        nn::{
            conv::{Conv2d, Conv2dConfig},
            BatchNorm, BatchNormConfig, Linear, LinearConfig,
        },
        prelude::*,
    };

    type TestBackend = NdArray<f32>;

    #[derive(Module, Debug)]
    struct Head<B: Backend> {
        norm: BatchNorm<B, 2>,
        proj: Linear<B>,
        convs: Vec<Conv2d<B>>,
    }

    fn head() -> Head<TestBackend> {
        let device = Default::default();
        Head {
            norm: BatchNormConfig::new(4).init(&device),
            proj: LinearConfig::new(2, 3).init(&device),
            convs: vec![
                Conv2dConfig::new([4, 4], [1, 1]).init(&device),
                Conv2dConfig::new([4, 1], [1, 1]).init(&device),
            ],
        }
    }

    fn tensor(shape: &[usize], values: Vec<f32>) -> CheckpointTensor {
        CheckpointTensor {
            shape: shape.to_vec(),
            values,
        }
    }

    #[test]
    fn test_paths_follow_the_record() {
        let params = ModelParams::collect::<TestBackend, _>(&head()).unwrap();
        let mut paths: Vec<_> = params.params.keys().cloned().collect();
        paths.sort();

        assert_eq!(
            paths,
            [
                "convs.0.bias",
                "convs.0.weight",
                "convs.1.bias",
                "convs.1.weight",
                "norm.beta",
                "norm.gamma",
                "norm.running_mean",
                "norm.running_var",
                "proj.bias",
                "proj.weight",
            ]
        );
        assert_eq!(params.params["convs.1.weight"].shape, vec![1, 4, 1, 1]);
        assert_eq!(params.target_path("norm.weight"), "norm.gamma");
        assert_eq!(params.target_path("norm.bias"), "norm.beta");
        assert_eq!(params.target_path("proj.bias"), "proj.bias");
        assert!(params.is_linear_weight("proj.weight"));
        assert!(!params.is_linear_weight("convs.0.weight"));
    }

    #[test]
    fn test_partial_checkpoint_keeps_other_params() {
        let device = Default::default();
        let module = head();
        let proj_bias = param_values::<TestBackend, _>(&module, "proj.bias").unwrap();
        let conv_weight = param_values::<TestBackend, _>(&module, "convs.0.weight").unwrap();

        let tensors = HashMap::from([
            ("norm.weight".to_string(), tensor(&[4], vec![1.0, 2.0, 3.0, 4.0])),
            (
                "proj.weight".to_string(),
                tensor(&[3, 2], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]),
            ),
            ("convs.1.bias".to_string(), tensor(&[1], vec![0.5])),
            ("norm.num_batches_tracked".to_string(), tensor(&[], vec![7.0])),
        ]);

        let (module, report) = bind::<TestBackend, _>(module, tensors, &device).unwrap();

        assert_eq!(report.bound, 3);
        assert_eq!(report.unused, ["norm.num_batches_tracked"]);
        assert!(report.missing.contains(&"norm.beta".to_string()));
        assert!(!report.missing.contains(&"norm.gamma".to_string()));

        let value = |path| param_values::<TestBackend, _>(&module, path).unwrap();
        assert_eq!(value("norm.gamma"), [1.0, 2.0, 3.0, 4.0]);
        assert_eq!(value("norm.beta"), [0.0; 4]);
        // [out, in] rows become burn's [in, out]
        assert_eq!(value("proj.weight"), [1.0, 3.0, 5.0, 2.0, 4.0, 6.0]);
        assert_eq!(value("convs.1.bias"), [0.5]);
        assert_eq!(value("proj.bias"), proj_bias);
        assert_eq!(value("convs.0.weight"), conv_weight);
    }

    #[test]
    fn test_bound_linear_matches_torch_layout() {
        let device = Default::default();
        let tensors = HashMap::from([
            (
                "proj.weight".to_string(),
                tensor(&[3, 2], vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0]),
            ),
            ("proj.bias".to_string(), tensor(&[3], vec![0.0, 0.0, 10.0])),
        ]);
        let (module, _) = bind::<TestBackend, _>(head(), tensors, &device).unwrap();

        let x = Tensor::<TestBackend, 2>::from_data(TensorData::new(vec![2.0f32, 3.0], [1, 2]), &device);
        let y = module.proj.forward(x).into_data().to_vec::<f32>().unwrap();

        assert_eq!(y, [2.0, 3.0, 15.0]);
    }

    #[test]
    fn test_shape_mismatch_is_rejected() {
        let device = Default::default();
        let tensors = HashMap::from([("norm.weight".to_string(), tensor(&[3], vec![1.0; 3]))]);

        let result = bind::<TestBackend, _>(head(), tensors, &device);

        assert!(matches!(
            result,
            Err(MdfraError::WeightLoadingFailed { .. })
        ));
    }
}

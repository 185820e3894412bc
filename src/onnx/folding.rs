// Constant folding for exported graphs
// Evaluates nodes whose inputs are all initializers and replaces them with the result.

use std::collections::{HashMap, HashSet};

use super::builder::{tensor_f32, tensor_i64};
use super::proto::{AttributeProto, DataType, GraphProto, NodeProto, TensorProto};

/// Summary of a folding pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FoldStats {
    pub folded_nodes: usize,
    pub removed_initializers: usize,
    /// Initializers decoded because a foldable node read them
    pub decoded_initializers: usize,
}

#[derive(Debug, Clone, PartialEq)]
enum Values {
    F32(Vec<f32>),
    I64(Vec<i64>),
}

#[derive(Debug, Clone, PartialEq)]
struct Const {
    dims: Vec<usize>,
    values: Values,
}

impl Const {
    fn from_proto(t: &TensorProto) -> Option<Self> {
        if t.dims.iter().any(|d| *d < 0) {
            return None;
        }
        let dims: Vec<usize> = t.dims.iter().map(|d| *d as usize).collect();
        let values = match t.data_type() {
            DataType::Float => Values::F32(t.f32_values()?),
            DataType::Int64 => Values::I64(t.i64_values()?),
            _ => return None,
        };
        let c = Self { dims, values };
        (c.len() == numel(&c.dims)).then_some(c)
    }

    fn into_proto(self, name: &str) -> TensorProto {
        let dims: Vec<i64> = self.dims.iter().map(|d| *d as i64).collect();
        match self.values {
            Values::F32(v) => tensor_f32(name, &dims, &v),
            Values::I64(v) => tensor_i64(name, &dims, &v),
        }
    }

    fn len(&self) -> usize {
        match &self.values {
            Values::F32(v) => v.len(),
            Values::I64(v) => v.len(),
        }
    }

    fn as_i64(&self) -> Option<&[i64]> {
        match &self.values {
            Values::I64(v) => Some(v),
            Values::F32(_) => None,
        }
    }
}

fn numel(dims: &[usize]) -> usize {
    dims.iter().product()
}

fn strides(dims: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; dims.len()];
    for i in (0..dims.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * dims[i + 1];
    }
    strides
}

fn unravel(mut index: usize, dims: &[usize], coords: &mut [usize]) {
    for axis in (0..dims.len()).rev() {
        coords[axis] = index % dims[axis];
        index /= dims[axis];
    }
}

/// Known constant values. Initializers are decoded the first time a
/// foldable node reads them; folded results are stored as they are produced.
struct ConstantPool<'a> {
    initializers: HashMap<&'a str, &'a TensorProto>,
    values: HashMap<String, Const>,
    decoded: usize,
}

impl<'a> ConstantPool<'a> {
    fn new(initializers: &'a [TensorProto], graph_inputs: &HashSet<String>) -> Self {
        Self {
            initializers: initializers
                .iter()
                .filter(|t| !graph_inputs.contains(&t.name))
                .map(|t| (t.name.as_str(), t))
                .collect(),
            values: HashMap::new(),
            decoded: 0,
        }
    }

    fn is_constant(&self, name: &str) -> bool {
        self.values.contains_key(name) || self.initializers.contains_key(name)
    }

    /// Make `name` available in `values`, decoding its initializer if needed
    fn load(&mut self, name: &str) -> bool {
        if self.values.contains_key(name) {
            return true;
        }
        let Some(tensor) = self.initializers.get(name) else {
            return false;
        };
        self.decoded += 1;
        match Const::from_proto(tensor) {
            Some(value) => {
                self.values.insert(name.to_string(), value);
                true
            }
            None => false,
        }
    }
}

fn is_evaluable(op_type: &str) -> bool {
    matches!(
        op_type,
        "Identity" | "Transpose" | "Slice" | "Add" | "Sub" | "Mul" | "Div" | "Sqrt"
    )
}

/// Fold every foldable node in place.
///
/// Nodes producing graph outputs are left alone, and initializers that are
/// no longer referenced afterwards are dropped.
pub fn fold_constants(graph: &mut GraphProto) -> FoldStats {
    let graph_inputs: HashSet<String> = graph.input.iter().map(|v| v.name.clone()).collect();
    let graph_outputs: HashSet<String> = graph.output.iter().map(|v| v.name.clone()).collect();

    let mut stats = FoldStats::default();
    let mut kept = Vec::with_capacity(graph.node.len());
    let mut produced = Vec::new();
    let nodes = std::mem::take(&mut graph.node);

    {
        let mut pool = ConstantPool::new(&graph.initializer, &graph_inputs);

        for node in nodes {
            let inputs = || node.input.iter().filter(|i| !i.is_empty());
            let foldable = node.output.len() == 1
                && is_evaluable(&node.op_type)
                && !graph_outputs.contains(&node.output[0])
                && inputs().all(|i| pool.is_constant(i))
                && inputs().all(|i| pool.load(i));

            let result = if foldable {
                evaluate(&node, &pool.values)
            } else {
                None
            };

            match result {
                Some(value) => {
                    let name = node.output[0].clone();
                    pool.values.insert(name.clone(), value.clone());
                    produced.push((name, value));
                    stats.folded_nodes += 1;
                }
                None => kept.push(node),
            }
        }
        stats.decoded_initializers = pool.decoded;
    }
    graph.node = kept;

    for (name, value) in produced {
        graph.initializer.push(value.into_proto(&name));
    }

    let mut used: HashSet<&str> = graph
        .node
        .iter()
        .flat_map(|n| n.input.iter().map(String::as_str))
        .collect();
    used.extend(graph.output.iter().map(|v| v.name.as_str()));
    let used: HashSet<String> = used.into_iter().map(str::to_string).collect();

    let before = graph.initializer.len();
    graph
        .initializer
        .retain(|t| used.contains(&t.name) || graph_inputs.contains(&t.name));
    stats.removed_initializers = before - graph.initializer.len();

    stats
}

fn attr<'a>(node: &'a NodeProto, name: &str) -> Option<&'a AttributeProto> {
    node.attribute.iter().find(|a| a.name == name)
}

fn evaluate(node: &NodeProto, constants: &HashMap<String, Const>) -> Option<Const> {
    let arg = |i: usize| -> Option<&Const> {
        let name = node.input.get(i)?;
        if name.is_empty() {
            None
        } else {
            constants.get(name)
        }
    };

    match node.op_type.as_str() {
        "Identity" => arg(0).cloned(),
        "Transpose" => {
            let perm = attr(node, "perm").map(|a| a.ints.clone());
            transpose(arg(0)?, perm)
        }
        "Slice" => slice(arg(0)?, arg(1)?, arg(2)?, arg(3), arg(4)),
        "Add" => binary(arg(0)?, arg(1)?, |a, b| a + b),
        "Sub" => binary(arg(0)?, arg(1)?, |a, b| a - b),
        "Mul" => binary(arg(0)?, arg(1)?, |a, b| a * b),
        "Div" => binary(arg(0)?, arg(1)?, |a, b| a / b),
        "Sqrt" => match &arg(0)?.values {
            Values::F32(v) => Some(Const {
                dims: arg(0)?.dims.clone(),
                values: Values::F32(v.iter().map(|x| x.sqrt()).collect()),
            }),
            Values::I64(_) => None,
        },
        _ => None,
    }
}

fn transpose(input: &Const, perm: Option<Vec<i64>>) -> Option<Const> {
    let rank = input.dims.len();
    let perm: Vec<usize> = match perm {
        Some(p) => p.iter().map(|v| *v as usize).collect(),
        None => (0..rank).rev().collect(),
    };
    if perm.len() != rank || perm.iter().any(|p| *p >= rank) {
        return None;
    }

    let out_dims: Vec<usize> = perm.iter().map(|p| input.dims[*p]).collect();
    let in_strides = strides(&input.dims);
    let mut coords = vec![0; rank];
    let gather = |out_index: usize, coords: &mut Vec<usize>| -> usize {
        unravel(out_index, &out_dims, coords);
        coords
            .iter()
            .zip(&perm)
            .map(|(c, p)| c * in_strides[*p])
            .sum()
    };

    let values = match &input.values {
        Values::F32(v) => Values::F32(
            (0..numel(&out_dims))
                .map(|i| v[gather(i, &mut coords)])
                .collect(),
        ),
        Values::I64(v) => Values::I64(
            (0..numel(&out_dims))
                .map(|i| v[gather(i, &mut coords)])
                .collect(),
        ),
    };
    Some(Const {
        dims: out_dims,
        values,
    })
}

fn slice(
    input: &Const,
    starts: &Const,
    ends: &Const,
    axes: Option<&Const>,
    steps: Option<&Const>,
) -> Option<Const> {
    let rank = input.dims.len() as i64;
    let starts = starts.as_i64()?;
    let ends = ends.as_i64()?;
    let axes: Vec<i64> = match axes {
        Some(a) => a.as_i64()?.to_vec(),
        None => (0..starts.len() as i64).collect(),
    };
    let steps: Vec<i64> = match steps {
        Some(s) => s.as_i64()?.to_vec(),
        None => vec![1; starts.len()],
    };
    if ends.len() != starts.len() || axes.len() != starts.len() || steps.len() != starts.len() {
        return None;
    }

    let mut begin = vec![0usize; input.dims.len()];
    let mut step = vec![1usize; input.dims.len()];
    let mut out_dims = input.dims.clone();

    for i in 0..starts.len() {
        let axis = if axes[i] < 0 { axes[i] + rank } else { axes[i] };
        if axis < 0 || axis >= rank || steps[i] <= 0 {
            return None;
        }
        let axis = axis as usize;
        let dim = input.dims[axis] as i64;
        let clamp = |v: i64| -> i64 {
            let v = if v < 0 { v + dim } else { v };
            v.clamp(0, dim)
        };
        let (s, e) = (clamp(starts[i]), clamp(ends[i]));
        let len = if e > s { (e - s + steps[i] - 1) / steps[i] } else { 0 };
        begin[axis] = s as usize;
        step[axis] = steps[i] as usize;
        out_dims[axis] = len as usize;
    }

    let in_strides = strides(&input.dims);
    let mut coords = vec![0; input.dims.len()];
    let mut offsets = Vec::with_capacity(numel(&out_dims));
    for i in 0..numel(&out_dims) {
        unravel(i, &out_dims, &mut coords);
        offsets.push(
            coords
                .iter()
                .enumerate()
                .map(|(axis, c)| (begin[axis] + c * step[axis]) * in_strides[axis])
                .sum::<usize>(),
        );
    }

    let values = match &input.values {
        Values::F32(v) => Values::F32(offsets.iter().map(|o| v[*o]).collect()),
        Values::I64(v) => Values::I64(offsets.iter().map(|o| v[*o]).collect()),
    };
    Some(Const {
        dims: out_dims,
        values,
    })
}

fn binary(a: &Const, b: &Const, op: impl Fn(f32, f32) -> f32) -> Option<Const> {
    let (Values::F32(av), Values::F32(bv)) = (&a.values, &b.values) else {
        return None;
    };

    let rank = a.dims.len().max(b.dims.len());
    let pad = |dims: &[usize]| -> Vec<usize> {
        let mut padded = vec![1; rank - dims.len()];
        padded.extend_from_slice(dims);
        padded
    };
    let (ad, bd) = (pad(&a.dims), pad(&b.dims));

    let mut out_dims = Vec::with_capacity(rank);
    for (x, y) in ad.iter().zip(&bd) {
        out_dims.push(match (*x, *y) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => return None,
        });
    }

    let broadcast_strides = |dims: &[usize]| -> Vec<usize> {
        strides(dims)
            .into_iter()
            .zip(dims)
            .map(|(s, d)| if *d == 1 { 0 } else { s })
            .collect()
    };
    let (a_strides, b_strides) = (broadcast_strides(&ad), broadcast_strides(&bd));

    let mut coords = vec![0; rank];
    let mut out = Vec::with_capacity(numel(&out_dims));
    for i in 0..numel(&out_dims) {
        unravel(i, &out_dims, &mut coords);
        let ai: usize = coords.iter().zip(&a_strides).map(|(c, s)| c * s).sum();
        let bi: usize = coords.iter().zip(&b_strides).map(|(c, s)| c * s).sum();
        out.push(op(av[ai], bv[bi]));
    }

    Some(Const {
        dims: out_dims,
        values: Values::F32(out),
    })
}

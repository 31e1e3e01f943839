//! Evaluation driver shared by the interpreter and the kernel machine
//!
//! A [`Frame`] describes the items of one call: either a flat run of `count`
//! elements or one padded ND block. The driver computes hoisted reductions once,
//! then asks the engine for each valid item and writes results through a staging
//! buffer of at most [`SCRATCH_ITEMS`] values, so working memory never depends on
//! the size of the array the caller is iterating over.

use serde::Serialize;
use tracing::trace;

use crate::buffer::{Input, Output};
use crate::config::RuntimeConfig;
use crate::dtype::Dtype;
use crate::error::EvalResult;
use crate::ir::{IndexVar, Program, StrOperand};
use crate::nd::BlockRegion;
use crate::simd::MathBackend;
use crate::value::Value;

/// Upper bound on staged output values per call
pub const SCRATCH_ITEMS: usize = 4096;

/// Per-item local slots; `None` until assigned
pub(crate) type Locals = Vec<Option<Value>>;

/// What one evaluation call did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EvalStats {
    /// `interpreter`, `jit` or `column`
    pub engine: &'static str,
    /// Items produced (1 for a root reduction)
    pub items: usize,
    /// Largest number of values staged at once
    pub scratch_items: usize,
}

#[derive(Debug, Clone)]
pub(crate) enum Layout {
    Flat { count: usize },
    Block(BlockRegion),
}

/// Inputs and item geometry of one call
pub(crate) struct Frame<'a> {
    inputs: &'a [Input<'a>],
    layout: Layout,
}

impl<'a> Frame<'a> {
    pub fn flat(inputs: &'a [Input<'a>], count: usize) -> Self {
        Self {
            inputs,
            layout: Layout::Flat { count },
        }
    }

    pub fn block(inputs: &'a [Input<'a>], region: BlockRegion) -> Self {
        Self {
            inputs,
            layout: Layout::Block(region),
        }
    }

    /// Items written, padding included
    pub fn items(&self) -> usize {
        match &self.layout {
            Layout::Flat { count } => *count,
            Layout::Block(region) => region.items(),
        }
    }

    /// Whether `item` holds real data
    pub fn contains(&self, item: usize) -> bool {
        match &self.layout {
            Layout::Flat { count } => item < *count,
            Layout::Block(region) => region.contains(item),
        }
    }

    pub fn index(&self, var: IndexVar, item: usize) -> i64 {
        match (&self.layout, var) {
            (Layout::Flat { .. }, IndexVar::Coord(_)) => item as i64,
            (Layout::Flat { count }, IndexVar::Extent(_)) => *count as i64,
            (Layout::Flat { .. }, IndexVar::Ndim) => 1,
            (Layout::Block(region), IndexVar::Coord(d)) => region.coord(item, d) as i64,
            (Layout::Block(region), IndexVar::Extent(d)) => region.extent(d) as i64,
            (Layout::Block(region), IndexVar::Ndim) => region.ndim() as i64,
        }
    }

    pub fn input(&self, slot: usize, item: usize) -> Value {
        self.inputs[slot].get(item)
    }

    /// Code points of a string operand at `item`
    pub fn string<'s>(&'s self, operand: &'s StrOperand, item: usize) -> &'s [u32] {
        match operand {
            StrOperand::Input(slot) => self.inputs[*slot].str_at(item),
            StrOperand::Literal(chars) => chars,
        }
    }
}

/// Everything an engine needs while running one call
pub(crate) struct Ctx<'a> {
    pub program: &'a Program,
    pub frame: &'a Frame<'a>,
    pub backend: MathBackend,
    pub max_iterations: u64,
    /// Values of hoisted reductions, by reduction index
    pub hoisted: Vec<Option<Value>>,
}

impl Ctx<'_> {
    pub fn hoisted(&self, index: usize) -> Option<Value> {
        self.hoisted.get(index).copied().flatten()
    }
}

/// An execution strategy for a typed program
pub(crate) trait Engine {
    fn name(&self) -> &'static str;

    /// Reduction `index` over every valid item, with `locals` visible to its argument
    fn reduce(&self, ctx: &Ctx<'_>, index: usize, locals: &Locals) -> EvalResult<Value>;

    /// Output value of one valid item, already of the output dtype
    fn element(&self, ctx: &Ctx<'_>, item: usize) -> EvalResult<Value>;
}

/// Run `program` over `frame`, writing `frame.items()` values (or one for a root
/// reduction) into `output`. Buffer sizes are checked by the caller.
pub(crate) fn run(
    engine: &dyn Engine,
    program: &Program,
    frame: &Frame<'_>,
    output: &mut Output<'_>,
    config: &RuntimeConfig,
) -> EvalResult<EvalStats> {
    let mut ctx = Ctx {
        program,
        frame,
        backend: config.math_backend(),
        max_iterations: config.max_while_iterations,
        hoisted: vec![None; program.reductions.len()],
    };
    let no_locals = Locals::new();
    for (index, reduction) in program.reductions.iter().enumerate() {
        if reduction.hoisted {
            let value = engine.reduce(&ctx, index, &no_locals)?;
            ctx.hoisted[index] = Some(value);
        }
    }

    if let Some(root) = program.root_reduction {
        if let Some(value) = ctx.hoisted(root) {
            output.set(0, value.cast(program.output));
        }
        trace!(engine = engine.name(), items = frame.items(), "root reduction evaluated");
        return Ok(EvalStats {
            engine: engine.name(),
            items: 1,
            scratch_items: 0,
        });
    }

    let items = frame.items();
    let capacity = items.min(SCRATCH_ITEMS);
    let mut stage: Vec<Value> = Vec::with_capacity(capacity);
    let padding = Value::zero(program.output);
    let mut start = 0;
    while start < items {
        let end = (start + capacity).min(items);
        stage.clear();
        for item in start..end {
            let value = if frame.contains(item) {
                engine.element(&ctx, item)?
            } else {
                padding
            };
            stage.push(value);
        }
        for (offset, value) in stage.iter().enumerate() {
            output.set(start + offset, *value);
        }
        start = end;
    }

    trace!(engine = engine.name(), items, "evaluated");
    Ok(EvalStats {
        engine: engine.name(),
        items,
        scratch_items: capacity,
    })
}

/// Map a bare transcendental call over one float column without staging.
/// Returns `None` when the program is not of that shape.
pub(crate) fn run_column(
    program: &Program,
    inputs: &[Input<'_>],
    output: &mut Output<'_>,
    count: usize,
    backend: &MathBackend,
) -> Option<EvalStats> {
    let (func, slot) = program.column_call()?;
    if !backend.vectorized {
        return None;
    }
    let input = inputs.get(slot)?;
    match output.dtype() {
        Dtype::Float64 => {
            let src = input.as_f64()?;
            let dst = output.as_f64_mut()?;
            backend.map_f64(func, &src[..count], &mut dst[..count]);
        }
        Dtype::Float32 => {
            let src = input.as_f32()?;
            let dst = output.as_f32_mut()?;
            backend.map_f32(func, &src[..count], &mut dst[..count]);
        }
        _ => return None,
    }
    trace!(func = ?func, count, "column evaluated");
    Some(EvalStats {
        engine: "column",
        items: count,
        scratch_items: 0,
    })
}

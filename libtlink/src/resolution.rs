//! Symbol resolution. Builds the single global name→address table, diagnosing duplicate
//! definitions as soon as they appear and collecting unresolved references so they can all be
//! reported at once.

use crate::error::Result;
use crate::input_data::FileId;
use crate::layout::Layout;
use crate::object_file::Symbol;
use crate::object_file::SymbolKind;
use crate::parsing::InputObject;
use anyhow::bail;
use foldhash::HashSet;
use hashbrown::HashMap;
use itertools::Itertools as _;
use tracing::debug;

#[derive(Debug)]
pub(crate) struct ResolvedSymbol {
    /// Absolute address in the output address space.
    pub(crate) value: u64,
    /// The input that defined the symbol.
    pub(crate) file_id: FileId,
}

#[derive(Debug)]
pub(crate) struct GlobalSymbolTable {
    by_name: HashMap<String, ResolvedSymbol>,
}

impl GlobalSymbolTable {
    pub(crate) fn get(&self, name: &str) -> Option<&ResolvedSymbol> {
        self.by_name.get(name)
    }
}

/// Walks inputs in command-line order and each input's symbols in declaration order. A name may
/// be referenced (U) before it is defined (D) by a later input; only two definitions of the same
/// name are an error.
#[tracing::instrument(skip_all, name = "Symbol resolution")]
pub(crate) fn resolve_symbols(inputs: &[InputObject], layout: &Layout) -> Result<GlobalSymbolTable> {
    let mut by_name: HashMap<String, ResolvedSymbol> = HashMap::new();
    let mut pending: Vec<(&str, &InputObject)> = Vec::new();

    for input in inputs {
        for symbol in &input.object.symbols {
            match symbol.kind {
                SymbolKind::Defined => {
                    if let Some(existing) = by_name.get(&symbol.name) {
                        bail!(
                            "symbol `{}` defined multiple times: {}, {}",
                            symbol.name,
                            inputs[existing.file_id.as_usize()].name(),
                            input.name(),
                        );
                    }
                    let value = resolve_value(input, symbol, layout)?;
                    debug!(
                        symbol = %symbol.name,
                        value = %format!("{value:#x}"),
                        file = %input.name(),
                        "resolved symbol",
                    );
                    by_name.insert(
                        symbol.name.clone(),
                        ResolvedSymbol {
                            value,
                            file_id: input.file_id,
                        },
                    );
                }
                SymbolKind::Undefined => pending.push((&symbol.name, input)),
            }
        }
    }

    // References satisfied by a later definition drop out here; anything left has no provider
    // anywhere in the link, so report the lot in one error, each (name, file) pair once.
    let mut seen: HashSet<(&str, FileId)> = HashSet::default();
    let unresolved = pending
        .iter()
        .filter(|(name, input)| {
            !by_name.contains_key(*name) && seen.insert((*name, input.file_id))
        })
        .map(|(name, input)| {
            format!("symbol `{name}`, referenced in {}, is not defined", input.name())
        })
        .join("\n");
    if !unresolved.is_empty() {
        bail!("{unresolved}");
    }

    Ok(GlobalSymbolTable { by_name })
}

/// Translates a symbol's segment-relative value into an absolute address by adding the base of
/// the defining file's contribution to the symbol's segment.
fn resolve_value(input: &InputObject, symbol: &Symbol, layout: &Layout) -> Result<u64> {
    let id = symbol
        .segment
        .and_then(|index| layout.output_segments.id_by_index(index));
    let Some(id) = id else {
        let segnum = symbol.segment.map_or(0, |index| index.segnum());
        bail!(
            "symbol `{}` in {} is defined relative to segment number {segnum}, which is not in \
             the output segment table",
            symbol.name,
            input.name(),
        );
    };
    let Some(contribution) = layout.contribution(id, input.file_id) else {
        bail!(
            "symbol `{}` in {} is defined relative to segment `{}`, but that file contributes \
             nothing to it",
            symbol.name,
            input.name(),
            layout.output_segments.name(id),
        );
    };
    Ok(symbol.value + contribution.address)
}

use std::collections::HashMap;

use crate::object::instruction::Insn;

/// Ordered sequence of instructions plus an optional block-entry label and a
/// map from instruction index to per-instruction intra-block label (spec
/// §3 "Block"). The unit of late address resolution: the linker assigns a
/// starting address to the block's own label, then walks instructions in
/// order assigning addresses to intra-block labels as it goes.
#[derive(Debug, Default)]
pub struct Block {
    /// Label naming this block's first byte, if any (e.g. a method entry
    /// point or a runtime subroutine).
    pub label: Option<String>,
    instructions: Vec<Insn>,
    /// instruction index -> label name, attached to whatever instruction is
    /// appended next after `set_next_label` was called.
    intra_labels: HashMap<usize, String>,
    pending_label: Option<String>,
}

impl Block {
    pub fn new(label: impl Into<Option<String>>) -> Self {
        Block { label: label.into(), ..Default::default() }
    }

    pub fn instructions(&self) -> &[Insn] {
        &self.instructions
    }

    pub fn instruction_count(&self) -> usize {
        self.instructions.len()
    }

    pub fn size_bytes(&self) -> u16 {
        self.instructions.iter().map(Insn::size).sum()
    }

    /// Attaches `name` to whichever instruction is appended next. Calling
    /// this twice before an `append` overwrites the pending name — callers
    /// never do this in practice, since each IL offset produces at most one
    /// `instruction_XXXX` label (spec §4.4 "Branch labels").
    pub fn set_next_label(&mut self, name: impl Into<String>) {
        self.pending_label = Some(name.into());
    }

    pub fn append(&mut self, insn: Insn) {
        if let Some(name) = self.pending_label.take() {
            self.intra_labels.insert(self.instructions.len(), name);
        }
        self.instructions.push(insn);
    }

    /// Removes the last `n` instructions and any intra-block labels that
    /// pointed into the removed range (spec §3 invariant, §8 "Remove-last-N
    /// soundness"). A label attached via `set_next_label` but not yet
    /// consumed by an `append` is untouched: it still fires on whatever is
    /// appended next, which is exactly the new end of the block.
    pub fn remove_last_n(&mut self, n: usize) {
        assert!(n <= self.instructions.len(), "remove_last_n: block too short");
        let new_len = self.instructions.len() - n;
        self.instructions.truncate(new_len);
        self.intra_labels.retain(|&idx, _| idx < new_len);
    }

    /// Resolves every intra-block label to an absolute address, given the
    /// address `base` at which this block's first instruction lands.
    pub fn local_label_addresses(&self, base: u16) -> HashMap<String, u16> {
        let mut out = HashMap::new();
        let mut addr = base;
        for (idx, insn) in self.instructions.iter().enumerate() {
            if let Some(name) = self.intra_labels.get(&idx) {
                out.insert(name.clone(), addr);
            }
            addr = addr.wrapping_add(insn.size());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::mnemonic::{AddressingMode::Implied, Mnemonic::{Nop, Rts, Tax}};
    use crate::object::operand::Operand;

    fn nop() -> Insn {
        Insn::new(Nop, Implied, Operand::None)
    }

    #[test]
    fn remove_last_n_matches_never_having_emitted_them() {
        let mut a = Block::new(None);
        a.append(nop());

        let mut full = Block::new(None);
        full.append(nop());
        full.append(Insn::implied(Tax));
        full.append(Insn::implied(Rts));
        full.remove_last_n(2);

        assert_eq!(full.instructions(), a.instructions());
        assert_eq!(full.local_label_addresses(0x8000), a.local_label_addresses(0x8000));
    }

    #[test]
    fn removed_labels_disappear_pending_label_survives() {
        let mut b = Block::new(None);
        b.append(nop());
        b.set_next_label("mid");
        b.append(Insn::implied(Tax));
        b.set_next_label("end");
        b.append(Insn::implied(Rts));

        // Removing the last instruction also removes the "end" label that
        // pointed at it.
        b.remove_last_n(1);
        assert!(!b.local_label_addresses(0x8000).contains_key("end"));
        assert!(b.local_label_addresses(0x8000).contains_key("mid"));

        // A label set but never consumed survives removal and attaches to
        // whatever is appended next.
        b.set_next_label("reattached");
        b.remove_last_n(1);
        b.append(Insn::implied(Rts));
        assert!(b.local_label_addresses(0x8000).contains_key("reattached"));
    }
}

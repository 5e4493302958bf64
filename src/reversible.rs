/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Undoable optimization steps.
//!
//! Every change the scheduler makes to the graph, the resource manager
//! or the renamer while trying something out is wrapped in a
//! [`Reversible`] step. Steps may run child steps before (`pre`) or after
//! (`post`) their own change. Undoing a step unwinds its post children,
//! then its own change, then its pre children, each newest first, so an
//! arbitrarily nested attempt can be taken back in exactly the reverse
//! order of application.

use crate::ddg::DataDependenceGraph;
use crate::renamer::RegisterRenamer;
use crate::resource::ResourceManager;
use crate::selector::MoveNodeSelector;
use crate::MoveId;
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;

/// The mutable scheduling state a step may touch.
pub struct Context<'a, 'm> {
    pub ddg: &'a mut DataDependenceGraph,
    pub rm: &'a mut dyn ResourceManager,
    pub renamer: Option<&'a mut RegisterRenamer<'m>>,
    pub selector: Option<&'a mut MoveNodeSelector>,
}

impl<'a, 'm> Context<'a, 'm> {
    pub fn new(ddg: &'a mut DataDependenceGraph, rm: &'a mut dyn ResourceManager) -> Self {
        Context {
            ddg,
            rm,
            renamer: None,
            selector: None,
        }
    }

    pub fn with_renamer(mut self, renamer: &'a mut RegisterRenamer<'m>) -> Self {
        self.renamer = Some(renamer);
        self
    }

    pub fn with_selector(mut self, selector: &'a mut MoveNodeSelector) -> Self {
        self.selector = Some(selector);
        self
    }

    /// Tell the selector, if any, that `n` may have become ready.
    pub fn might_be_ready(&mut self, n: MoveId) {
        if let Some(selector) = self.selector.as_deref_mut() {
            if self.ddg.node(n).is_live() && !self.ddg.is_scheduled(n) {
                selector.might_be_ready(self.ddg, n);
            }
        }
    }
}

pub trait Reversible: fmt::Debug {
    /// Apply the step. Returns `false` when the step does not apply. In
    /// that case it has made no change of its own, but children it ran
    /// before failing are still applied; see
    /// [`unwind_children`](Self::unwind_children).
    fn execute(&mut self, cx: &mut Context<'_, '_>) -> bool;

    /// Take back the step's own change.
    fn undo_only_me(&mut self, cx: &mut Context<'_, '_>);

    fn children(&mut self) -> Option<&mut Children> {
        None
    }

    /// Take back a successfully executed step together with its children.
    fn undo(&mut self, cx: &mut Context<'_, '_>) {
        if let Some(children) = self.children() {
            children.undo_post(cx);
        }
        self.undo_only_me(cx);
        if let Some(children) = self.children() {
            children.undo_pre(cx);
        }
    }

    /// Take back the children of a step whose `execute` failed.
    fn unwind_children(&mut self, cx: &mut Context<'_, '_>) {
        if let Some(children) = self.children() {
            children.undo_post(cx);
            children.undo_pre(cx);
        }
    }
}

/// Child steps run around a parent's own change.
#[derive(Debug, Default)]
pub struct Children {
    pre: Vec<Box<dyn Reversible>>,
    post: Vec<Box<dyn Reversible>>,
}

impl Children {
    pub fn new() -> Self {
        Self::default()
    }

    fn run(
        stack: &mut Vec<Box<dyn Reversible>>,
        cx: &mut Context<'_, '_>,
        mut child: Box<dyn Reversible>,
    ) -> bool {
        if child.execute(cx) {
            stack.push(child);
            true
        } else {
            child.unwind_children(cx);
            false
        }
    }

    /// Run a child that precedes the parent's own change. A failing
    /// child leaves earlier siblings in place for the parent to unwind.
    pub fn run_pre(&mut self, cx: &mut Context<'_, '_>, child: Box<dyn Reversible>) -> bool {
        Self::run(&mut self.pre, cx, child)
    }

    pub fn run_post(&mut self, cx: &mut Context<'_, '_>, child: Box<dyn Reversible>) -> bool {
        Self::run(&mut self.post, cx, child)
    }

    pub fn undo_pre(&mut self, cx: &mut Context<'_, '_>) {
        while let Some(mut child) = self.pre.pop() {
            child.undo(cx);
        }
    }

    pub fn undo_post(&mut self, cx: &mut Context<'_, '_>) {
        while let Some(mut child) = self.post.pop() {
            child.undo(cx);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pre.is_empty() && self.post.is_empty()
    }
}

/// A sequence of steps that either all stay applied or are all taken
/// back.
#[derive(Debug, Default)]
pub struct Attempt {
    applied: Vec<Box<dyn Reversible>>,
}

impl Attempt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Execute `step` and keep it on success. A failed step leaves
    /// nothing behind; steps applied earlier stay until `rollback`.
    pub fn try_run(&mut self, cx: &mut Context<'_, '_>, mut step: Box<dyn Reversible>) -> bool {
        if step.execute(cx) {
            self.applied.push(step);
            true
        } else {
            trace!("attempt: {:?} did not apply", step);
            step.unwind_children(cx);
            false
        }
    }

    pub fn run<S: Reversible + 'static>(&mut self, cx: &mut Context<'_, '_>, step: S) -> bool {
        self.try_run(cx, Box::new(step))
    }

    /// Run every step in order. On the first failure everything this
    /// attempt applied is undone and `false` returned.
    pub fn run_all<I>(&mut self, cx: &mut Context<'_, '_>, steps: I) -> bool
    where
        I: IntoIterator<Item = Box<dyn Reversible>>,
    {
        for step in steps {
            if !self.try_run(cx, step) {
                self.rollback_in_place(cx);
                return false;
            }
        }
        true
    }

    fn rollback_in_place(&mut self, cx: &mut Context<'_, '_>) {
        while let Some(mut step) = self.applied.pop() {
            step.undo(cx);
        }
    }

    /// Undo everything, newest first.
    pub fn rollback(mut self, cx: &mut Context<'_, '_>) {
        self.rollback_in_place(cx);
    }

    /// Keep the applied steps. They can still be undone later through
    /// the returned record.
    pub fn commit(self) -> Applied {
        Applied {
            steps: self.applied,
        }
    }

    pub fn len(&self) -> usize {
        self.applied.len()
    }

    pub fn is_empty(&self) -> bool {
        self.applied.is_empty()
    }
}

/// Steps of a committed attempt.
#[derive(Debug, Default)]
pub struct Applied {
    steps: Vec<Box<dyn Reversible>>,
}

impl Applied {
    pub fn undo(mut self, cx: &mut Context<'_, '_>) {
        while let Some(mut step) = self.steps.pop() {
            step.undo(cx);
        }
    }

    pub fn append(&mut self, mut other: Applied) {
        self.steps.append(&mut other.steps);
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

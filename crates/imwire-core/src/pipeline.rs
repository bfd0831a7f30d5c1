//! Generic ordered-processor pipeline
//!
//! A pipeline runs an input through an explicitly registered sequence of
//! processors. Each processor declares which inputs it accepts, may append
//! outputs, and may mark the input consumed. The codec pipelines in
//! [`crate::codec`] are all instantiations of [`ProcessorPipeline`].
//!
//! Invariants:
//! - processors run in registration order
//! - with `stop_when_consumed`, a consumed input is not shown to later processors
//! - a processor failure discards every contribution made for that input and
//!   surfaces as a [`CodecError`] naming the stage and processor

use core::fmt;
use core::marker::PhantomData;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::errors::{CodecError, ProcessorFailure};

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Behavioural switches of one pipeline
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfiguration {
    /// Skip remaining processors once one marks the input consumed
    pub stop_when_consumed: bool,
}

impl PipelineConfiguration {
    pub fn stop_when_consumed() -> Self {
        Self {
            stop_when_consumed: true,
        }
    }
}

// ----------------------------------------------------------------------------
// Input Description
// ----------------------------------------------------------------------------

/// Inputs name their kind so failures and traces can say what was processed
pub trait PipelineInput {
    fn kind_name(&self) -> &'static str;
}

// ----------------------------------------------------------------------------
// Processor Context
// ----------------------------------------------------------------------------

/// Per-call view handed to a processor
pub struct ProcessorContext<'a, Ctx, Out> {
    context: &'a mut Ctx,
    outputs: &'a mut Vec<Out>,
    consumed: bool,
}

impl<'a, Ctx, Out> ProcessorContext<'a, Ctx, Out> {
    pub fn context(&self) -> &Ctx {
        self.context
    }

    pub fn context_mut(&mut self) -> &mut Ctx {
        self.context
    }

    /// Contribute one output for the current input
    pub fn collect(&mut self, output: Out) {
        self.outputs.push(output);
    }

    /// Declare the current input fully handled
    pub fn mark_consumed(&mut self) {
        self.consumed = true;
    }

    pub fn is_consumed(&self) -> bool {
        self.consumed
    }
}

// ----------------------------------------------------------------------------
// Processor
// ----------------------------------------------------------------------------

/// One transformation step with a declared input capability
pub trait Processor<Ctx, In: ?Sized, Out>: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this processor can handle `input` at all
    fn accepts(&self, _input: &In) -> bool {
        true
    }

    fn process(
        &self,
        input: &In,
        cx: &mut ProcessorContext<'_, Ctx, Out>,
    ) -> Result<(), ProcessorFailure>;
}

// ----------------------------------------------------------------------------
// Outcome
// ----------------------------------------------------------------------------

/// Result of running one input through a pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutcome<Out> {
    pub outputs: Vec<Out>,
    /// At least one processor accepted the input
    pub handled: bool,
    pub consumed: bool,
}

// ----------------------------------------------------------------------------
// Pipeline
// ----------------------------------------------------------------------------

/// Ordered processor execution engine
pub struct ProcessorPipeline<P: ?Sized, Ctx, In: ?Sized, Out> {
    stage: &'static str,
    processors: Vec<Box<P>>,
    configuration: PipelineConfiguration,
    context_factory: fn() -> Ctx,
    _marker: PhantomData<fn(&In) -> Out>,
}

impl<P, Ctx, In, Out> ProcessorPipeline<P, Ctx, In, Out>
where
    P: Processor<Ctx, In, Out> + ?Sized,
    In: PipelineInput + ?Sized,
    Out: fmt::Debug,
{
    pub fn new(
        stage: &'static str,
        configuration: PipelineConfiguration,
        context_factory: fn() -> Ctx,
    ) -> Self {
        Self {
            stage,
            processors: Vec::new(),
            configuration,
            context_factory,
            _marker: PhantomData,
        }
    }

    /// Append a processor; registration order is execution order
    pub fn register(&mut self, processor: Box<P>) -> &mut Self {
        self.processors.push(processor);
        self
    }

    pub fn with_processor(mut self, processor: Box<P>) -> Self {
        self.processors.push(processor);
        self
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn configuration(&self) -> PipelineConfiguration {
        self.configuration
    }

    pub fn processor_names(&self) -> Vec<&'static str> {
        self.processors.iter().map(|p| p.name()).collect()
    }

    /// Whether any registered processor accepts `input`
    pub fn can_handle(&self, input: &In) -> bool {
        self.processors.iter().any(|p| p.accepts(input))
    }

    /// Fresh context for one invocation
    pub fn create_context(&self) -> Ctx {
        (self.context_factory)()
    }

    /// Run one input through the registered processors
    pub fn process(&self, input: &In, context: &mut Ctx) -> Result<ProcessOutcome<Out>, CodecError> {
        let tracing = crate::trace::is_enabled();
        let mut outputs = Vec::new();
        let mut handled = false;
        let mut consumed = false;

        for processor in &self.processors {
            if !processor.accepts(input) {
                continue;
            }
            handled = true;

            if tracing {
                trace!(
                    stage = self.stage,
                    processor = processor.name(),
                    input = input.kind_name(),
                    "invoking processor"
                );
            }

            let before = outputs.len();
            let mut cx = ProcessorContext {
                context: &mut *context,
                outputs: &mut outputs,
                consumed,
            };

            // Dropping `outputs` here discards this input's partial contributions
            processor.process(input, &mut cx).map_err(|source| CodecError {
                stage: self.stage,
                processor: processor.name(),
                element_type: input.kind_name(),
                source,
            })?;
            consumed = cx.consumed;

            if tracing {
                trace!(
                    stage = self.stage,
                    processor = processor.name(),
                    contribution = ?&outputs[before..],
                    consumed,
                    "processor finished"
                );
            }

            if consumed && self.configuration.stop_when_consumed {
                break;
            }
        }

        Ok(ProcessOutcome {
            outputs,
            handled,
            consumed,
        })
    }

    /// Run a batch of independent inputs sharing one context
    ///
    /// A failure or early stop on one input does not affect the others.
    pub fn process_all<'i, I>(
        &self,
        inputs: I,
        context: &mut Ctx,
    ) -> Vec<Result<ProcessOutcome<Out>, CodecError>>
    where
        I: IntoIterator<Item = &'i In>,
        In: 'i,
    {
        inputs
            .into_iter()
            .map(|input| self.process(input, context))
            .collect()
    }
}

impl<P: ?Sized, Ctx, In: ?Sized, Out> fmt::Debug for ProcessorPipeline<P, Ctx, In, Out> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorPipeline")
            .field("stage", &self.stage)
            .field("processors", &self.processors.len())
            .field("configuration", &self.configuration)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::{AttributeContext, AttributeKey};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const SEEN: AttributeKey<Vec<&'static str>> = AttributeKey::new("seen");

    struct Word(&'static str);

    impl PipelineInput for Word {
        fn kind_name(&self) -> &'static str {
            "word"
        }
    }

    struct Step {
        name: &'static str,
        consumes: bool,
        fails: bool,
        only: Option<&'static str>,
        calls: Arc<AtomicUsize>,
    }

    impl Step {
        fn new(name: &'static str) -> Self {
            Self {
                name,
                consumes: false,
                fails: false,
                only: None,
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn consuming(mut self) -> Self {
            self.consumes = true;
            self
        }

        fn failing(mut self) -> Self {
            self.fails = true;
            self
        }

        fn only(mut self, word: &'static str) -> Self {
            self.only = Some(word);
            self
        }
    }

    impl Processor<AttributeContext, Word, String> for Step {
        fn name(&self) -> &'static str {
            self.name
        }

        fn accepts(&self, input: &Word) -> bool {
            self.only.map_or(true, |word| word == input.0)
        }

        fn process(
            &self,
            input: &Word,
            cx: &mut ProcessorContext<'_, AttributeContext, String>,
        ) -> Result<(), ProcessorFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            cx.context_mut()
                .get_or_insert_with(&SEEN, Vec::new)
                .push(self.name);
            cx.collect(format!("{}:{}", self.name, input.0));
            if self.fails {
                return Err(ProcessorFailure::malformed("word", "refused"));
            }
            if self.consumes {
                cx.mark_consumed();
            }
            Ok(())
        }
    }

    type TestPipeline = ProcessorPipeline<
        dyn Processor<AttributeContext, Word, String>,
        AttributeContext,
        Word,
        String,
    >;

    fn pipeline(configuration: PipelineConfiguration) -> TestPipeline {
        ProcessorPipeline::new("test", configuration, AttributeContext::new)
    }

    #[test]
    fn test_processors_run_in_registration_order() {
        let pipeline = pipeline(PipelineConfiguration::default())
            .with_processor(Box::new(Step::new("a")))
            .with_processor(Box::new(Step::new("b")))
            .with_processor(Box::new(Step::new("c")));
        let mut context = pipeline.create_context();

        let outcome = pipeline.process(&Word("x"), &mut context).unwrap();
        assert_eq!(outcome.outputs, vec!["a:x", "b:x", "c:x"]);
        assert!(outcome.handled);
        assert!(!outcome.consumed);
        assert_eq!(context.get(&SEEN), Some(&vec!["a", "b", "c"]));
    }

    #[test]
    fn test_stop_when_consumed_skips_later_processors() {
        let b = Step::new("b");
        let c = Step::new("c");
        let (b_calls, c_calls) = (b.calls.clone(), c.calls.clone());
        let pipeline = pipeline(PipelineConfiguration::stop_when_consumed())
            .with_processor(Box::new(Step::new("a").consuming()))
            .with_processor(Box::new(b))
            .with_processor(Box::new(c));
        let mut context = pipeline.create_context();

        let outcome = pipeline.process(&Word("x"), &mut context).unwrap();
        assert_eq!(outcome.outputs, vec!["a:x"]);
        assert!(outcome.consumed);
        assert_eq!(b_calls.load(Ordering::SeqCst), 0);
        assert_eq!(c_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_consumed_without_stop_keeps_going() {
        let pipeline = pipeline(PipelineConfiguration::default())
            .with_processor(Box::new(Step::new("a").consuming()))
            .with_processor(Box::new(Step::new("b")));
        let mut context = pipeline.create_context();

        let outcome = pipeline.process(&Word("x"), &mut context).unwrap();
        assert_eq!(outcome.outputs, vec!["a:x", "b:x"]);
        assert!(outcome.consumed);
    }

    #[test]
    fn test_failure_names_processor_and_discards_partial_output() {
        let c = Step::new("c");
        let c_calls = c.calls.clone();
        let pipeline = pipeline(PipelineConfiguration::default())
            .with_processor(Box::new(Step::new("a")))
            .with_processor(Box::new(Step::new("b").failing()))
            .with_processor(Box::new(c));
        let mut context = pipeline.create_context();

        let error = pipeline.process(&Word("x"), &mut context).unwrap_err();
        assert_eq!(error.stage, "test");
        assert_eq!(error.processor, "b");
        assert_eq!(error.element_type, "word");
        assert_eq!(c_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_batch_continues_after_consumed_and_failed_inputs() {
        let pipeline = pipeline(PipelineConfiguration::stop_when_consumed())
            .with_processor(Box::new(Step::new("stop").consuming().only("first")))
            .with_processor(Box::new(Step::new("boom").failing().only("second")))
            .with_processor(Box::new(Step::new("tail")));
        let mut context = pipeline.create_context();
        let inputs = [Word("first"), Word("second"), Word("third")];

        let results = pipeline.process_all(inputs.iter(), &mut context);
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_ref().unwrap().outputs, vec!["stop:first"]);
        assert!(results[1].is_err());
        assert_eq!(results[2].as_ref().unwrap().outputs, vec!["tail:third"]);
    }

    #[test]
    fn test_unhandled_input_is_reported() {
        let pipeline = pipeline(PipelineConfiguration::default())
            .with_processor(Box::new(Step::new("a").only("known")));
        let mut context = pipeline.create_context();

        assert!(!pipeline.can_handle(&Word("other")));
        let outcome = pipeline.process(&Word("other"), &mut context).unwrap();
        assert!(!outcome.handled);
        assert!(outcome.outputs.is_empty());
    }

    #[test]
    fn test_tracing_switch_does_not_change_results() {
        let pipeline = pipeline(PipelineConfiguration::default())
            .with_processor(Box::new(Step::new("a")));
        crate::trace::set_enabled(true);
        let mut context = pipeline.create_context();
        let traced = pipeline.process(&Word("x"), &mut context).unwrap();
        crate::trace::set_enabled(false);
        let mut context = pipeline.create_context();
        let plain = pipeline.process(&Word("x"), &mut context).unwrap();
        assert_eq!(traced, plain);
    }
}

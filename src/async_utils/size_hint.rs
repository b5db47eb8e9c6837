//! Streams with a known length, for progress bars.

use std::{
    pin::Pin,
    task::{Context, Poll},
};

use futures::Stream;

/// Wraps a stream, reporting a caller-supplied size hint that counts down as
/// items are produced.
pub struct SizeHintStream<S> {
    stream: S,
    size_hint: (usize, Option<usize>),
}

impl<S> SizeHintStream<S> {
    pub fn new(stream: S, size_hint: (usize, Option<usize>)) -> Self {
        Self { stream, size_hint }
    }
}

impl<S> Stream for SizeHintStream<S>
where
    S: Stream + Unpin,
{
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.stream).poll_next(cx);
        if let Poll::Ready(Some(_)) = &polled {
            let (lower, upper) = this.size_hint;
            this.size_hint = (lower.saturating_sub(1), upper.map(|n| n.saturating_sub(1)));
        }
        polled
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.size_hint
    }
}

/// Adds [`WithSizeHintExt::with_size_hint`] to every stream.
pub trait WithSizeHintExt: Stream + Sized {
    fn with_size_hint(self, size_hint: (usize, Option<usize>)) -> SizeHintStream<Self> {
        SizeHintStream::new(self, size_hint)
    }
}

impl<S> WithSizeHintExt for S where S: Stream {}

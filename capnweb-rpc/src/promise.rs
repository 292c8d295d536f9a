// Copyright (c) 2013-2017 Sandstorm Development Group, Inc. and contributors
// Licensed under the MIT License:
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN
// THE SOFTWARE.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

/// A computation that is either already settled or still running, resolving
/// to a value of type `T` or an error of type `E`. Dropping the promise
/// cancels the computation.
///
/// Hook operations hand these out so that immediate results (a local
/// payload, a broken capability) cost nothing beyond the struct itself,
/// while deferred results (remote calls, chained promises) box their future
/// exactly once.
#[must_use = "a Promise does nothing until awaited"]
pub struct Promise<T, E> {
    settled: Option<Result<T, E>>,
    running: Option<Pin<Box<dyn Future<Output = Result<T, E>> + 'static>>>,
}

// Nothing here pins `T` or `E` in place: the settled slot is moved out
// whole, and the running future is behind its own pin.
impl<T, E> Unpin for Promise<T, E> {}

impl<T, E> Promise<T, E> {
    pub fn ok(value: T) -> Self {
        Self::from_result(Ok(value))
    }

    pub fn err(error: E) -> Self {
        Self::from_result(Err(error))
    }

    pub fn from_result(result: Result<T, E>) -> Self {
        Self {
            settled: Some(result),
            running: None,
        }
    }

    pub fn from_future<F>(f: F) -> Self
    where
        F: Future<Output = Result<T, E>> + 'static,
    {
        Self {
            settled: None,
            running: Some(Box::pin(f)),
        }
    }

    /// Takes the result if it is already available, handing the promise back
    /// otherwise. Callers use this to avoid re-wrapping an already-settled
    /// result in another layer of promise.
    pub fn ready(mut self) -> Result<Result<T, E>, Self> {
        match self.settled.take() {
            Some(result) => Ok(result),
            None => Err(self),
        }
    }
}

impl<T, E> Future for Promise<T, E> {
    type Output = Result<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(result) = this.settled.take() {
            return Poll::Ready(result);
        }
        match this.running.as_mut() {
            Some(future) => future.as_mut().poll(cx),
            None => panic!("promise polled after completion"),
        }
    }
}

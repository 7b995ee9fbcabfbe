//! Method registry and dispatch.
//!
//! Binding is single-threaded and happens before `run`; after that, dispatch
//! is pure with respect to dispatcher state, so many workers can call
//! [`Dispatcher::dispatch`] concurrently without synchronization. Arity and
//! per-parameter conversion are resolved once at bind time, a statically
//! typed stand-in for a template-driven adapter.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::DockRpcError;

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, DockRpcError>> + Send>>;
type BoundFn = Arc<dyn Fn(Vec<Value>) -> HandlerFuture + Send + Sync>;

struct BoundMethod {
    arity: usize,
    call: BoundFn,
}

/// Marker types identifying a handler's arity so a single `bind` method name
/// can resolve to the right conversion path at compile time (the same
/// pattern web frameworks use for route handler extraction).
pub struct Arity0;
pub struct Arity1<P1>(std::marker::PhantomData<P1>);
pub struct Arity2<P1, P2>(std::marker::PhantomData<(P1, P2)>);
pub struct Arity3<P1, P2, P3>(std::marker::PhantomData<(P1, P2, P3)>);
pub struct Arity4<P1, P2, P3, P4>(std::marker::PhantomData<(P1, P2, P3, P4)>);

/// Implemented for any `Fn(..) -> Fut` whose parameters deserialize from
/// [`serde_json::Value`] and whose output serializes back to one. `Marker`
/// disambiguates overlapping arities so a bare closure resolves unambiguously.
pub trait IntoBoundMethod<Marker>: Send + Sync + 'static {
    fn arity(&self) -> usize;
    fn call(self: Arc<Self>, params: Vec<Value>) -> HandlerFuture;
}

fn convert_arg<T: DeserializeOwned>(params: &[Value], index: usize) -> Result<T, DockRpcError> {
    serde_json::from_value(params[index].clone()).map_err(|e| DockRpcError::BadArgument {
        index,
        reason: e.to_string(),
    })
}

fn to_result_value<R: Serialize, E: std::fmt::Display>(
    outcome: Result<R, E>,
) -> Result<Value, DockRpcError> {
    let value = outcome.map_err(|e| DockRpcError::HandlerFailed(e.to_string()))?;
    serde_json::to_value(value).map_err(DockRpcError::from)
}

impl<F, Fut, R, E> IntoBoundMethod<Arity0> for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
    R: Serialize,
    E: std::fmt::Display,
{
    fn arity(&self) -> usize {
        0
    }

    fn call(self: Arc<Self>, _params: Vec<Value>) -> HandlerFuture {
        Box::pin(async move { to_result_value(self().await) })
    }
}

macro_rules! impl_into_bound_method {
    ($marker:ident, $arity:expr, $( $p:ident ),+ ; $( $idx:expr ),+) => {
        impl<F, Fut, $($p,)+ R, E> IntoBoundMethod<$marker<$($p,)+>> for F
        where
            F: Fn($($p),+) -> Fut + Send + Sync + 'static,
            Fut: Future<Output = Result<R, E>> + Send + 'static,
            $($p: DeserializeOwned + Send + 'static,)+
            R: Serialize,
            E: std::fmt::Display,
        {
            fn arity(&self) -> usize {
                $arity
            }

            fn call(self: Arc<Self>, params: Vec<Value>) -> HandlerFuture {
                Box::pin(async move {
                    $( let $p = convert_arg::<$p>(&params, $idx)?; )+
                    to_result_value(self($($p),+).await)
                })
            }
        }
    };
}

impl_into_bound_method!(Arity1, 1, P1; 0);
impl_into_bound_method!(Arity2, 2, P1, P2; 0, 1);
impl_into_bound_method!(Arity3, 3, P1, P2, P3; 0, 1, 2);
impl_into_bound_method!(Arity4, 4, P1, P2, P3, P4; 0, 1, 2, 3);

#[derive(Default)]
pub struct Dispatcher {
    methods: HashMap<String, BoundMethod>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `callable` under `name`. Binding the same name twice
    /// replaces the prior binding.
    pub fn bind<Marker, H>(&mut self, name: impl Into<String>, callable: H)
    where
        H: IntoBoundMethod<Marker>,
    {
        let arity = callable.arity();
        let handler = Arc::new(callable);
        self.methods.insert(
            name.into(),
            BoundMethod {
                arity,
                call: Arc::new(move |params| handler.clone().call(params)),
            },
        );
    }

    pub fn is_bound(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    /// Dispatches `params` against the method named `method`. Never panics on
    /// bad input: conversion failures surface as [`DockRpcError::BadArgument`].
    pub async fn dispatch(&self, method: &str, params: Vec<Value>) -> Result<Value, DockRpcError> {
        let bound = self
            .methods
            .get(method)
            .ok_or_else(|| DockRpcError::MethodNotFound(method.to_string()))?;
        if params.len() != bound.arity {
            return Err(DockRpcError::ArityMismatch {
                method: method.to_string(),
                expected: bound.arity,
                got: params.len(),
            });
        }
        (bound.call)(params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn dispatches_bound_method() {
        let mut d = Dispatcher::new();
        d.bind("add", |a: i64, b: i64| async move { Ok::<i64, String>(a + b) });
        let result = d.dispatch("add", vec![json!(2), json!(3)]).await.unwrap();
        assert_eq!(result, json!(5));
    }

    #[tokio::test]
    async fn method_not_found() {
        let d = Dispatcher::new();
        let err = d.dispatch("noSuch", vec![]).await.unwrap_err();
        assert!(matches!(err, DockRpcError::MethodNotFound(ref m) if m == "noSuch"));
        assert_eq!(err.rpc_code(), 404);
    }

    #[tokio::test]
    async fn arity_mismatch() {
        let mut d = Dispatcher::new();
        d.bind("divide", |a: f64, b: f64| async move { Ok::<f64, String>(a / b) });
        let err = d.dispatch("divide", vec![json!(1.0)]).await.unwrap_err();
        match err {
            DockRpcError::ArityMismatch { expected, got, .. } => {
                assert_eq!(expected, 2);
                assert_eq!(got, 1);
            }
            _ => panic!("wrong error"),
        }
    }

    #[tokio::test]
    async fn handler_raises_becomes_handler_failed_500() {
        let mut d = Dispatcher::new();
        d.bind("divide", |a: f64, b: f64| async move {
            if b == 0.0 {
                Err("division by zero".to_string())
            } else {
                Ok(a / b)
            }
        });
        let err = d.dispatch("divide", vec![json!(1.0), json!(0.0)]).await.unwrap_err();
        assert_eq!(err.rpc_code(), 500);
        assert!(err.to_string().contains("zero"));
    }

    #[tokio::test]
    async fn bad_argument_reports_index() {
        let mut d = Dispatcher::new();
        d.bind("add", |a: i64, b: i64| async move { Ok::<i64, String>(a + b) });
        let err = d
            .dispatch("add", vec![json!("not a number"), json!(3)])
            .await
            .unwrap_err();
        match err {
            DockRpcError::BadArgument { index, .. } => assert_eq!(index, 0),
            _ => panic!("wrong error"),
        }
    }

    #[tokio::test]
    async fn rebinding_replaces_prior_binding() {
        let mut d = Dispatcher::new();
        d.bind("greet", || async move { Ok::<&'static str, String>("v1") });
        d.bind("greet", || async move { Ok::<&'static str, String>("v2") });
        let result = d.dispatch("greet", vec![]).await.unwrap();
        assert_eq!(result, json!("v2"));
    }
}

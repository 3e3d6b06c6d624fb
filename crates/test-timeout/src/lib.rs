//! `#[timeout]` and `#[tokio_timeout_test]` run a test body on a watchdog
//! thread and fail the test once its deadline passes.
//!
//! Both accept an optional deadline in seconds (`#[timeout(5)]`, default 60).
//! Setting `CAMP_TEST_TIMEOUT_SECS` at test time overrides every deadline.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, Attribute, Block, ItemFn, LitInt};

const DEFAULT_TIMEOUT_SECS: u64 = 60;
const OVERRIDE_VAR: &str = "CAMP_TEST_TIMEOUT_SECS";

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let secs = match parse_timeout(attr) {
        Ok(secs) => secs,
        Err(err) => return err.to_compile_error().into(),
    };
    let mut function = parse_macro_input!(item as ItemFn);
    if function.sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &function.sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }
    function.sig.asyncness = None;
    function.attrs.retain(|attr| !is_path(attr, &["tokio", "test"]));

    let block = &function.block;
    let body = quote! {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed to build Tokio runtime");
        runtime.block_on(async move {
            tokio::time::timeout(__deadline, async move #block)
                .await
                .expect("test timed out");
        });
    };
    expand(function, secs, body)
}

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let secs = match parse_timeout(attr) {
        Ok(secs) => secs,
        Err(err) => return err.to_compile_error().into(),
    };
    let mut function = parse_macro_input!(item as ItemFn);
    if function.sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &function.sig.ident,
            "timeout expects a synchronous test function; use tokio_timeout_test",
        )
        .to_compile_error()
        .into();
    }
    function.attrs.retain(|attr| !is_path(attr, &["test"]));

    let block = &function.block;
    let body = quote! {
        let _ = __deadline;
        #block
    };
    expand(function, secs, body)
}

fn parse_timeout(attr: TokenStream) -> syn::Result<u64> {
    if attr.is_empty() {
        return Ok(DEFAULT_TIMEOUT_SECS);
    }
    let lit: LitInt = syn::parse(attr)?;
    let secs: u64 = lit.base10_parse()?;
    if secs == 0 {
        return Err(syn::Error::new_spanned(lit, "timeout must be greater than zero"));
    }
    Ok(secs)
}

/// Wraps `body` in a `#[test]` that runs it on its own thread and waits at
/// most the deadline for a result. `body` sees the deadline as `__deadline`.
fn expand(function: ItemFn, secs: u64, body: TokenStream2) -> TokenStream {
    let ItemFn { attrs, vis, sig, .. } = function;
    let override_var = OVERRIDE_VAR;
    let wrapped: Block = syn::parse_quote!({
        let __deadline = std::time::Duration::from_secs(
            std::env::var(#override_var)
                .ok()
                .and_then(|value| value.parse::<u64>().ok())
                .filter(|secs| *secs > 0)
                .unwrap_or(#secs),
        );
        let (__tx, __rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| { #body }));
            let _ = __tx.send(outcome);
        });
        match __rx.recv_timeout(__deadline) {
            Ok(Ok(())) => {}
            Ok(Err(payload)) => std::panic::resume_unwind(payload),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                panic!("test timed out after {:?}", __deadline)
            }
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                panic!("test thread exited without reporting a result")
            }
        }
    });

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig #wrapped
    })
}

fn is_path(attr: &Attribute, expected: &[&str]) -> bool {
    let segments: Vec<_> = attr.path().segments.iter().map(|s| s.ident.to_string()).collect();
    segments.len() == expected.len() && segments.iter().zip(expected).all(|(a, b)| a == b)
}

//! Test attributes that run each test on its own thread and fail it once a
//! wall-clock deadline passes, so a wedged socket or channel never hangs the
//! whole suite.
//!
//! Arguments (any order, comma separated): an integer number of seconds
//! (default 60) and, for async tests, `paused` to start the Tokio clock paused.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::parse::Parser;
use syn::punctuated::Punctuated;
use syn::{Attribute, Expr, ExprLit, ExprPath, ItemFn, Lit, Token};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

struct Options {
    secs: u64,
    paused: bool,
}

fn parse_options(attr: TokenStream) -> syn::Result<Options> {
    let mut options = Options {
        secs: DEFAULT_TIMEOUT_SECS,
        paused: false,
    };
    let args = Punctuated::<Expr, Token![,]>::parse_terminated.parse(attr)?;
    for arg in args {
        match &arg {
            Expr::Lit(ExprLit {
                lit: Lit::Int(lit), ..
            }) => {
                let secs: u64 = lit.base10_parse()?;
                if secs == 0 {
                    return Err(syn::Error::new_spanned(
                        lit,
                        "timeout must be greater than zero",
                    ));
                }
                options.secs = secs;
            }
            Expr::Path(ExprPath { path, .. }) if path.is_ident("paused") => {
                options.paused = true;
            }
            other => {
                return Err(syn::Error::new_spanned(
                    other,
                    "expected a timeout in seconds or `paused`",
                ))
            }
        }
    }
    Ok(options)
}

/// Waits for the test thread, re-raising its panic or failing on timeout.
fn supervise(secs: u64, run: TokenStream2) -> TokenStream2 {
    quote! {
        let timeout_duration = std::time::Duration::from_secs(#secs);
        let (sender, receiver) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| { #run }));
            let _ = sender.send(result);
        });
        match receiver.recv_timeout(timeout_duration) {
            Ok(Ok(_)) => {}
            Ok(Err(payload)) => std::panic::resume_unwind(payload),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                panic!("test thread failed before reporting result")
            }
        }
    }
}

fn path_is(attr: &Attribute, expected: &[&str]) -> bool {
    let segments: Vec<String> = attr
        .path()
        .segments
        .iter()
        .map(|segment| segment.ident.to_string())
        .collect();
    segments == expected
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    match expand_async(attr, item) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

fn expand_async(attr: TokenStream, item: TokenStream) -> syn::Result<TokenStream2> {
    let options = parse_options(attr)?;
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = syn::parse::<ItemFn>(item)?;

    if sig.asyncness.is_none() {
        return Err(syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        ));
    }
    sig.asyncness = None;

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !path_is(attr, &["tokio", "test"]))
        .collect();

    let paused = if options.paused {
        quote! { builder.start_paused(true); }
    } else {
        quote! {}
    };
    let run = quote! {
        let mut builder = tokio::runtime::Builder::new_current_thread();
        builder.enable_all();
        #paused
        let runtime = builder.build().expect("failed to build Tokio runtime");
        runtime.block_on(async {
            tokio::time::timeout(timeout_duration, async move #block)
                .await
                .expect("test timed out");
        });
    };
    let body = supervise(options.secs, run);

    Ok(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #body
        }
    })
}

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    match expand_sync(attr, item) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

fn expand_sync(attr: TokenStream, item: TokenStream) -> syn::Result<TokenStream2> {
    let options = parse_options(attr)?;
    if options.paused {
        return Err(syn::Error::new(
            proc_macro2::Span::call_site(),
            "`paused` only applies to tokio_timeout_test",
        ));
    }
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = syn::parse::<ItemFn>(item)?;

    if sig.asyncness.is_some() {
        return Err(syn::Error::new_spanned(
            &sig.ident,
            "timeout attribute expects a synchronous test function",
        ));
    }

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !path_is(attr, &["test"]))
        .collect();
    let body = supervise(options.secs, quote! { #block });

    Ok(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #body
        }
    })
}

//! `#[async_test]`: runs an async test on its own Tokio runtime and fails it
//! when it does not finish in time.
//!
//! ```ignore
//! #[test_timeout::async_test(timeout = 10, flavor = "multi_thread", worker_threads = 4)]
//! async fn negotiates() { /* ... */ }
//!
//! #[test_timeout::async_test(timeout = 10, start_paused = true)]
//! async fn times_out_on_the_virtual_clock() { /* ... */ }
//! ```
//!
//! With `start_paused` the timeout is measured on Tokio's paused clock, so it
//! fires once the runtime has nothing left to do.

use proc_macro::TokenStream;
use quote::quote;
use syn::parse::Parser;
use syn::punctuated::Punctuated;
use syn::{Attribute, Expr, ExprLit, ItemFn, Lit, MetaNameValue, Token, parse_macro_input};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Flavor {
    CurrentThread,
    MultiThread,
}

struct Options {
    timeout_secs: u64,
    flavor: Flavor,
    worker_threads: Option<usize>,
    start_paused: bool,
}

impl Options {
    fn parse(args: Punctuated<MetaNameValue, Token![,]>) -> syn::Result<Self> {
        let mut paused_arg = None;
        let mut options = Options {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            flavor: Flavor::CurrentThread,
            worker_threads: None,
            start_paused: false,
        };
        for arg in args {
            let key = arg
                .path
                .get_ident()
                .map(ToString::to_string)
                .unwrap_or_default();
            match key.as_str() {
                "timeout" => {
                    let secs: u64 = int_value(&arg.value)?;
                    if secs == 0 {
                        return Err(syn::Error::new_spanned(&arg.value, "timeout must be greater than zero"));
                    }
                    options.timeout_secs = secs;
                }
                "flavor" => {
                    options.flavor = match str_value(&arg.value)?.as_str() {
                        "current_thread" => Flavor::CurrentThread,
                        "multi_thread" => Flavor::MultiThread,
                        _ => {
                            return Err(syn::Error::new_spanned(
                                &arg.value,
                                "flavor must be \"current_thread\" or \"multi_thread\"",
                            ));
                        }
                    };
                }
                "worker_threads" => {
                    let threads: usize = int_value(&arg.value)?;
                    if threads == 0 {
                        return Err(syn::Error::new_spanned(&arg.value, "worker_threads must be greater than zero"));
                    }
                    options.worker_threads = Some(threads);
                }
                "start_paused" => {
                    options.start_paused = bool_value(&arg.value)?;
                    paused_arg = Some(arg.clone());
                }
                _ => {
                    return Err(syn::Error::new_spanned(
                        &arg.path,
                        "expected `timeout`, `flavor`, `worker_threads` or `start_paused`",
                    ));
                }
            }
        }
        if options.worker_threads.is_some() && options.flavor == Flavor::CurrentThread {
            options.flavor = Flavor::MultiThread;
        }
        if let Some(arg) = paused_arg.filter(|_| options.start_paused) {
            if options.flavor == Flavor::MultiThread {
                return Err(syn::Error::new_spanned(
                    arg,
                    "start_paused requires the current_thread flavor",
                ));
            }
        }
        Ok(options)
    }
}

fn int_value<N>(expr: &Expr) -> syn::Result<N>
where
    N: std::str::FromStr,
    N::Err: std::fmt::Display,
{
    match expr {
        Expr::Lit(ExprLit {
            lit: Lit::Int(lit), ..
        }) => lit.base10_parse(),
        _ => Err(syn::Error::new_spanned(expr, "expected an integer literal")),
    }
}

fn bool_value(expr: &Expr) -> syn::Result<bool> {
    match expr {
        Expr::Lit(ExprLit {
            lit: Lit::Bool(lit), ..
        }) => Ok(lit.value),
        _ => Err(syn::Error::new_spanned(expr, "expected `true` or `false`")),
    }
}

fn str_value(expr: &Expr) -> syn::Result<String> {
    match expr {
        Expr::Lit(ExprLit {
            lit: Lit::Str(lit), ..
        }) => Ok(lit.value()),
        _ => Err(syn::Error::new_spanned(expr, "expected a string literal")),
    }
}

#[proc_macro_attribute]
pub fn async_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = match Punctuated::<MetaNameValue, Token![,]>::parse_terminated.parse(attr) {
        Ok(args) => args,
        Err(err) => return err.to_compile_error().into(),
    };
    let options = match Options::parse(args) {
        Ok(options) => options,
        Err(err) => return err.to_compile_error().into(),
    };

    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(&sig.ident, "async_test can only be applied to async functions")
            .to_compile_error()
            .into();
    }
    sig.asyncness = None;

    let attrs: Vec<Attribute> = attrs.into_iter().filter(|attr| !is_test_attribute(attr)).collect();

    let timeout = options.timeout_secs;
    let builder = match options.flavor {
        Flavor::CurrentThread if options.start_paused => quote! {
            {
                let mut builder = tokio::runtime::Builder::new_current_thread();
                builder.start_paused(true);
                builder
            }
        },
        Flavor::CurrentThread => quote! { tokio::runtime::Builder::new_current_thread() },
        Flavor::MultiThread => match options.worker_threads {
            Some(threads) => quote! {
                {
                    let mut builder = tokio::runtime::Builder::new_multi_thread();
                    builder.worker_threads(#threads);
                    builder
                }
            },
            None => quote! { tokio::runtime::Builder::new_multi_thread() },
        },
    };

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let timeout_duration = std::time::Duration::from_secs(#timeout);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    let runtime = #builder
                        .enable_all()
                        .build()
                        .expect("failed to build Tokio runtime");
                    runtime.block_on(async {
                        tokio::time::timeout(timeout_duration, async move #block)
                            .await
                            .expect("test timed out");
                    });
                }));
                let _ = sender.send(result);
            });
            // Grace on top of the in-runtime timeout for a wedged runtime.
            match receiver.recv_timeout(timeout_duration + std::time::Duration::from_secs(1)) {
                Ok(Ok(())) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread exited before reporting a result")
                }
            }
        }
    })
}

/// `#[test]` and `#[tokio::test]` would register the function twice.
fn is_test_attribute(attr: &Attribute) -> bool {
    let segments: Vec<String> = attr
        .path()
        .segments
        .iter()
        .map(|segment| segment.ident.to_string())
        .collect();
    matches!(
        segments.iter().map(String::as_str).collect::<Vec<_>>().as_slice(),
        ["test"] | ["tokio", "test"]
    )
}

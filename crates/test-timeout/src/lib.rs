use proc_macro::TokenStream;
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::punctuated::Punctuated;
use syn::{parse_macro_input, Attribute, Ident, ItemFn, LitInt, Token};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

enum Arg {
    Seconds(LitInt),
    Flavor(Ident),
}

impl Parse for Arg {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        if input.peek(LitInt) {
            input.parse().map(Arg::Seconds)
        } else {
            input.parse().map(Arg::Flavor)
        }
    }
}

#[derive(Clone, Copy)]
enum Flavor {
    CurrentThread,
    MultiThread,
}

struct Options {
    timeout_secs: u64,
    flavor: Flavor,
}

fn parse_options(args: Punctuated<Arg, Token![,]>) -> syn::Result<Options> {
    let mut options = Options {
        timeout_secs: DEFAULT_TIMEOUT_SECS,
        flavor: Flavor::CurrentThread,
    };
    for arg in args {
        match arg {
            Arg::Seconds(lit) => {
                let secs: u64 = lit.base10_parse()?;
                if secs == 0 {
                    return Err(syn::Error::new_spanned(
                        lit,
                        "timeout must be greater than zero",
                    ));
                }
                options.timeout_secs = secs;
            }
            Arg::Flavor(ident) if ident == "multi_thread" => options.flavor = Flavor::MultiThread,
            Arg::Flavor(ident) if ident == "current_thread" => {
                options.flavor = Flavor::CurrentThread
            }
            Arg::Flavor(ident) => {
                return Err(syn::Error::new_spanned(
                    ident,
                    "expected `multi_thread` or `current_thread`",
                ))
            }
        }
    }
    Ok(options)
}

/// Runs an async test on a fresh Tokio runtime in its own thread and fails it
/// once the timeout elapses.
///
/// `#[tokio_timeout_test]`, `#[tokio_timeout_test(10)]` and
/// `#[tokio_timeout_test(10, multi_thread)]` are accepted; the timeout is in
/// seconds and defaults to 60.
#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr with Punctuated::<Arg, Token![,]>::parse_terminated);
    let options = match parse_options(args) {
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
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }

    sig.asyncness = None;

    let filtered_attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_tokio_test_attribute(attr))
        .collect();

    let timeout = options.timeout_secs;
    let builder = match options.flavor {
        Flavor::CurrentThread => quote! { tokio::runtime::Builder::new_current_thread() },
        Flavor::MultiThread => quote! {
            {
                let mut builder = tokio::runtime::Builder::new_multi_thread();
                builder.worker_threads(2);
                builder
            }
        },
    };

    TokenStream::from(quote! {
        #[test]
        #(#filtered_attrs)*
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
            match receiver.recv_timeout(timeout_duration) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread failed before reporting result")
                }
            }
        }
    })
}

fn is_tokio_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!(
        (segments.next(), segments.next(), segments.next()),
        (Some(first), Some(second), None)
            if first.ident == "tokio" && second.ident == "test"
    )
}

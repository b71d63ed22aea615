use proc_macro::TokenStream;
use quote::quote;
use syn::{ItemFn, parse_macro_input};

/// Test attribute that installs logging before the body runs.
///
/// Async tests run on tokio and accept the same arguments as `#[tokio::test]`:
///
/// ```ignore
/// #[ddc::test(flavor = "multi_thread", worker_threads = 4)]
/// async fn scales_in() { ... }
///
/// #[ddc::test]
/// fn parses() { ... }
/// ```
#[proc_macro_attribute]
pub fn test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = proc_macro2::TokenStream::from(attr);
    let input = parse_macro_input!(item as ItemFn);
    let attrs = &input.attrs;
    let vis = &input.vis;
    let sig = &input.sig;
    let block = &input.block;
    let name = &sig.ident;

    let tokio_args = if args.is_empty() {
        quote! {}
    } else {
        quote! { ( #args ) }
    };

    let output = if sig.asyncness.is_some() {
        quote! {
            #(#attrs)*
            #[tokio::test #tokio_args]
            #vis #sig {
                ddc::trace::with_test_tracing(stringify!(#name), || async move #block).await
            }
        }
    } else {
        quote! {
            #(#attrs)*
            #[test]
            #vis #sig {
                ddc::trace::with_test_tracing_sync(stringify!(#name), || #block)
            }
        }
    };
    output.into()
}

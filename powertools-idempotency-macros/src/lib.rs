use proc_macro::TokenStream;
use quote::quote;
use syn::{parse::Parser, parse_macro_input, FnArg, ItemFn, Meta, ReturnType};

/// Makes an async function idempotent through an `IdempotencyHandler`.
///
/// # Example
///
/// ```rust,ignore
/// #[idempotent(handler = self.idempotency, payload = order)]
/// async fn charge(&self, order: Order) -> Result<Receipt, Error> {
///     // Your processing logic here
///     Ok(Receipt::new(&order))
/// }
/// ```
///
/// This will expand to code that converts `payload` to JSON and calls
/// `handler.handle(&payload, || async move { ... })`. With
/// `remaining_time = <expr>` the expansion calls `handle_with_remaining_time`
/// instead, bounding the in-progress record by that `Duration`.
///
/// # Requirements
///
/// - The function must be `async`
/// - The function must return `Result<T, E>` where `E: From<powertools_idempotency::Error>`
/// - `T` must implement `Serialize` and `DeserializeOwned`
/// - The `payload` expression must implement `Serialize`
#[proc_macro_attribute]
pub fn idempotent(attr: TokenStream, item: TokenStream) -> TokenStream {
    let input = parse_macro_input!(item as ItemFn);

    let parser = syn::punctuated::Punctuated::<Meta, syn::Token![,]>::parse_terminated;
    let args = match parser.parse(attr) {
        Ok(args) => args,
        Err(e) => return e.to_compile_error().into(),
    };

    let mut handler_expr = None;
    let mut payload_expr = None;
    let mut remaining_time_expr = None;

    for arg in args {
        match arg {
            Meta::NameValue(nv) => {
                let name = nv.path.get_ident().map(|i| i.to_string());
                match name.as_deref() {
                    Some("handler") => handler_expr = Some(nv.value),
                    Some("payload") => payload_expr = Some(nv.value),
                    Some("remaining_time") => remaining_time_expr = Some(nv.value),
                    _ => {
                        return syn::Error::new_spanned(
                            nv.path,
                            "Unknown attribute parameter. Expected 'handler', 'payload' or 'remaining_time'",
                        )
                        .to_compile_error()
                        .into();
                    }
                }
            }
            _ => {
                return syn::Error::new_spanned(
                    arg,
                    "Expected name-value pair like `handler = self.idempotency` or `payload = order`",
                )
                .to_compile_error()
                .into();
            }
        }
    }

    let Some(handler) = handler_expr else {
        return syn::Error::new(
            proc_macro2::Span::call_site(),
            "Missing required 'handler' parameter",
        )
        .to_compile_error()
        .into();
    };

    let Some(payload) = payload_expr else {
        return syn::Error::new(
            proc_macro2::Span::call_site(),
            "Missing required 'payload' parameter",
        )
        .to_compile_error()
        .into();
    };

    if input.sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            input.sig.fn_token,
            "The #[idempotent] macro can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }

    let fn_vis = &input.vis;
    let fn_name = &input.sig.ident;
    let fn_generics = &input.sig.generics;
    let where_clause = &input.sig.generics.where_clause;
    let fn_inputs = &input.sig.inputs;
    let fn_block = &input.block;
    let fn_attrs = &input.attrs;

    // Typed parameters are moved into the wrapped future; `self` is captured as is
    let param_names: Vec<_> = fn_inputs
        .iter()
        .filter_map(|arg| {
            if let FnArg::Typed(pat_type) = arg {
                if let syn::Pat::Ident(pat_ident) = &*pat_type.pat {
                    return Some(&pat_ident.ident);
                }
            }
            None
        })
        .collect();

    let return_type = match &input.sig.output {
        ReturnType::Default => {
            return syn::Error::new_spanned(&input.sig, "Function must return Result<T, E>")
                .to_compile_error()
                .into();
        }
        ReturnType::Type(_, ty) => ty,
    };

    let call = match remaining_time_expr {
        Some(remaining_time) => quote! {
            __idempotency_handler.handle_with_remaining_time(
                &__idempotency_payload,
                #remaining_time,
                || async move {
                    #(let #param_names = #param_names;)*
                    #fn_block
                },
            )
        },
        None => quote! {
            __idempotency_handler.handle(&__idempotency_payload, || async move {
                #(let #param_names = #param_names;)*
                #fn_block
            })
        },
    };

    let expanded = quote! {
        #(#fn_attrs)*
        #fn_vis async fn #fn_name #fn_generics(#fn_inputs) -> #return_type #where_clause {
            let __idempotency_payload =
                ::powertools_idempotency::__private::serde_json::to_value(&#payload)
                    .map_err(::powertools_idempotency::Error::from)?;
            let __idempotency_handler = &#handler;

            #call.await
        }
    };

    TokenStream::from(expanded)
}

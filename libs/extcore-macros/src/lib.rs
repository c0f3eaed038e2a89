//! `#[extension(...)]` — announces an `Extension` impl to the process-wide registry.
//!
//! Expands to a hidden registrator function plus an `inventory::submit!` of
//! it, so the extension self-registers before `main` runs without the host
//! binary needing to name it anywhere.

use heck::ToSnakeCase;
use proc_macro::TokenStream;
use proc_macro2::Span;
use quote::quote;
use syn::{
    parse::Parse, parse::ParseStream, parse_macro_input, punctuated::Punctuated, DeriveInput, Expr,
    Lit, LitStr, Meta, Token,
};

/// Configuration parsed from `#[extension(...)]`.
///
/// Dependency edges are declared once, in the `Extension::dependencies()`
/// impl — the macro only registers the instance and sanity-checks that the
/// name it was given matches what `Extension::name()` returns at runtime,
/// so a copy-pasted attribute can't silently drift from the impl.
struct ExtensionConfig {
    name: String,
    ctor: Option<Expr>,
}

impl Parse for ExtensionConfig {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let mut name: Option<String> = None;
        let mut ctor: Option<Expr> = None;

        let mut seen_name = false;
        let mut seen_ctor = false;

        let punctuated: Punctuated<Meta, Token![,]> =
            input.parse_terminated(Meta::parse, Token![,])?;

        for meta in punctuated {
            match meta {
                Meta::NameValue(nv) if nv.path.is_ident("name") => {
                    if seen_name {
                        return Err(syn::Error::new_spanned(nv.path, "duplicate `name` parameter"));
                    }
                    seen_name = true;
                    match nv.value {
                        Expr::Lit(syn::ExprLit {
                            lit: Lit::Str(s), ..
                        }) => name = Some(s.value()),
                        other => {
                            return Err(syn::Error::new_spanned(
                                other,
                                "name must be a string literal, e.g. name = \"storage\"",
                            ));
                        }
                    }
                }
                Meta::NameValue(nv) if nv.path.is_ident("ctor") => {
                    if seen_ctor {
                        return Err(syn::Error::new_spanned(nv.path, "duplicate `ctor` parameter"));
                    }
                    seen_ctor = true;
                    match &nv.value {
                        Expr::Lit(syn::ExprLit {
                            lit: Lit::Str(s), ..
                        }) => {
                            return Err(syn::Error::new_spanned(
                                s,
                                "ctor must be a Rust expression, not a string literal. \
                                 Use: ctor = MyExtension::new()  or:  ctor = Default::default()",
                            ));
                        }
                        _ => ctor = Some(nv.value.clone()),
                    }
                }
                other => {
                    return Err(syn::Error::new_spanned(
                        other,
                        "unknown parameter; expected name, ctor",
                    ));
                }
            }
        }

        let name = name.ok_or_else(|| {
            syn::Error::new(Span::call_site(), "missing required `name = \"...\"` parameter")
        })?;

        Ok(Self { name, ctor })
    }
}

/// Registers the annotated type's `Extension` impl with the process-wide
/// inventory table. The type must already implement `extcore::Extension`
/// (via `#[async_trait]`) and either derive `Default` or supply `ctor = ...`.
///
/// ```ignore
/// #[extension(name = "greeter")]
/// #[derive(Default)]
/// struct Greeter;
/// ```
#[proc_macro_attribute]
pub fn extension(attr: TokenStream, item: TokenStream) -> TokenStream {
    let config = parse_macro_input!(attr as ExtensionConfig);
    let input = parse_macro_input!(item as DeriveInput);

    let struct_ident = &input.ident;
    let name_lit = LitStr::new(&config.name, Span::call_site());

    let constructor: Expr = config
        .ctor
        .unwrap_or_else(|| syn::parse_quote! { #struct_ident::default() });

    let struct_name_snake = struct_ident.to_string().to_snake_case();
    let registrator_name =
        syn::Ident::new(&format!("__{struct_name_snake}_registrator"), Span::call_site());

    let expanded = quote! {
        #input

        #[doc(hidden)]
        fn #registrator_name(b: &mut ::extcore::registry::RegistryBuilder) {
            let ext: ::std::sync::Arc<dyn ::extcore::contracts::Extension> =
                ::std::sync::Arc::new(#constructor);
            assert_eq!(
                ext.name(),
                #name_lit,
                "extension attribute name {:?} does not match Extension::name() {:?}",
                #name_lit,
                ext.name(),
            );
            b.register(ext);
        }

        ::extcore::inventory::submit! {
            ::extcore::registry::Registrator(#registrator_name)
        }
    };

    TokenStream::from(expanded)
}

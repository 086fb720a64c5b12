//! A derive macro for the `Event` trait in the `sourcerer` crate.
use proc_macro::TokenStream;
use quote::quote;
use syn::{Data, DeriveInput, Fields, LitInt, LitStr, Meta, Token, parse_macro_input};

struct EventAttr {
    version: Option<u16>,
    source: Option<String>,
}

/// Parses an `#[event(version = 1, source = "urn:...")]` attribute, if
/// present, from a list of attributes on an enum or one of its variants.
fn parse_event_attr(attrs: &[syn::Attribute]) -> EventAttr {
    let mut version = None;
    let mut source = None;

    for attr in attrs {
        if !attr.path().is_ident("event") {
            continue;
        }
        let metas = attr
            .parse_args_with(syn::punctuated::Punctuated::<Meta, Token![,]>::parse_terminated)
            .expect("malformed #[event(...)] attribute");
        for meta in metas {
            let Meta::NameValue(nv) = meta else {
                panic!("expected `key = value` inside #[event(...)]");
            };
            if nv.path.is_ident("version") {
                let lit: LitInt = syn::parse2(nv.value.into_token_stream())
                    .expect("#[event(version = ...)] must be an integer literal");
                version = Some(lit.base10_parse::<u16>().expect("event version must fit in u16"));
            } else if nv.path.is_ident("source") {
                let lit: LitStr = syn::parse2(nv.value.into_token_stream())
                    .expect("#[event(source = ...)] must be a string literal");
                source = Some(lit.value());
            }
        }
    }

    EventAttr { version, source }
}

use quote::ToTokens;

/// Derives the `Event` trait for an enum.
///
/// `event_type` returns the variant's name. `event_version` and
/// `event_source` default to an enum-level `#[event(version = ..., source =
/// "...")]` attribute, which any variant may override with its own
/// `#[event(...)]` attribute.
#[proc_macro_derive(Event, attributes(event))]
pub fn event_derive(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let name = &input.ident;

    let variants = match &input.data {
        Data::Enum(data) => &data.variants,
        _ => panic!("Event derive macro can only be used on enums"),
    };

    let enum_default = parse_event_attr(&input.attrs);

    let event_type_arms = variants.iter().map(|variant| {
        let variant_name = &variant.ident;
        let fields = match &variant.fields {
            Fields::Named(_) => quote! { { .. } },
            Fields::Unnamed(_) => quote! { (..) },
            Fields::Unit => quote! {},
        };
        quote! {
            #name::#variant_name #fields => stringify!(#variant_name)
        }
    });

    let event_version_arms = variants.iter().map(|variant| {
        let variant_name = &variant.ident;
        let fields = match &variant.fields {
            Fields::Named(_) => quote! { { .. } },
            Fields::Unnamed(_) => quote! { (..) },
            Fields::Unit => quote! {},
        };
        let attr = parse_event_attr(&variant.attrs);
        let version = attr.version.or(enum_default.version).unwrap_or(1);
        quote! {
            #name::#variant_name #fields => #version
        }
    });

    let event_source_arms = variants.iter().map(|variant| {
        let variant_name = &variant.ident;
        let fields = match &variant.fields {
            Fields::Named(_) => quote! { { .. } },
            Fields::Unnamed(_) => quote! { (..) },
            Fields::Unit => quote! {},
        };
        let attr = parse_event_attr(&variant.attrs);
        let source = attr
            .source
            .or_else(|| enum_default.source.clone())
            .unwrap_or_else(|| "urn:sourcerer:event".to_string());
        quote! {
            #name::#variant_name #fields => #source
        }
    });

    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let expanded = quote! {
        impl #impl_generics sourcerer::Event for #name #ty_generics #where_clause {
            fn event_type(&self) -> &'static str {
                match self {
                    #(#event_type_arms),*
                }
            }

            fn event_version(&self) -> u16 {
                match self {
                    #(#event_version_arms),*
                }
            }

            fn event_source(&self) -> &'static str {
                match self {
                    #(#event_source_arms),*
                }
            }
        }
    };

    TokenStream::from(expanded)
}

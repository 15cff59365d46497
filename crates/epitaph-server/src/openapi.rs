use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Epitaph API",
        version = "0.3.0",
        description = "Start, stop and observe death-fact enrichment runs."
    ),
    paths(
        crate::routes::start_run,
        crate::routes::list_runs,
        crate::routes::get_run,
        crate::routes::stop_run,
        crate::routes::subject_history,
        crate::routes::health,
    ),
    components(schemas(
        crate::dto::StartRunRequest,
        crate::dto::StartRunResponse,
        crate::dto::CausePolicy,
        crate::dto::CountersResponse,
        crate::dto::RunProgressResponse,
        crate::dto::RunListResponse,
        crate::dto::StopRunResponse,
        crate::dto::HistoryEntryResponse,
        crate::dto::HistoryResponse,
        crate::dto::HealthResponse,
        crate::dto::ErrorResponse,
    )),
    tags(
        (name = "runs", description = "Batch run control"),
        (name = "subjects", description = "Per-subject provenance"),
        (name = "system", description = "Health and system status"),
    ),
    modifiers(&SecurityAddon)
)]
pub struct ApiDoc;

/// Adds Bearer token security scheme to the OpenAPI spec.
struct SecurityAddon;

impl utoipa::Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer",
                utoipa::openapi::security::SecurityScheme::Http(
                    utoipa::openapi::security::HttpBuilder::new()
                        .scheme(utoipa::openapi::security::HttpAuthScheme::Bearer)
                        .bearer_format("token")
                        .description(Some(
                            "Admin token. Set via EPITAPH_ADMIN_TOKEN environment variable.",
                        ))
                        .build(),
                ),
            );
        }
    }
}
